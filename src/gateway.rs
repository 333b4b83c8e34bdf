//! Gateway (§4.G): composes a server transport with either a single
//! pre-configured backend client transport, or a per-client factory backed
//! by an LRU of live backends.

use crate::error::BridgeResult;
use crate::jsonrpc::JsonRpcMessage;
use crate::lru_store::LruStore;
use crate::transport::client::ClientTransport;
use crate::transport::server::ServerTransport;
use crate::transport::{OnClientSessionEvicted, OnMessage, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Semaphore};
use tracing::warn;

pub const DEFAULT_BACKEND_CACHE_CAPACITY: usize = 1_000;

fn request_id_str(msg: &JsonRpcMessage) -> Option<String> {
    match msg {
        JsonRpcMessage::Request(r) => match &r.id {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        },
        _ => None,
    }
}

/// A backend capable of handling one client's MCP traffic. Implemented by
/// `ClientTransport` in production; test doubles implement it directly.
#[async_trait]
pub trait Backend: Transport {
    /// Optional graceful pre-close hook (e.g. notify the upstream server
    /// this session is ending) run before `close()` on eviction.
    async fn terminate_session(&self) {}
}

enum Backing {
    Single(Arc<dyn Backend>),
    Factory {
        create: Arc<dyn Fn(String) -> BridgeResult<Arc<dyn Backend>> + Send + Sync>,
        cache: Mutex<LruStore<String, Arc<dyn Backend>>>,
        inflight: Mutex<HashMap<String, Vec<oneshot::Sender<Option<Arc<dyn Backend>>>>>>,
        inflight_gate: Semaphore,
    },
}

/// A `ClientTransport` speaking for this process to an upstream Nostr-native
/// MCP server is itself a valid `Backend` — the Nostr-to-Nostr gateway mode
/// (§4.G): the server side gates/meters access, the client side forwards to
/// the real capability provider.
#[async_trait]
impl Backend for ClientTransport {}

pub struct Gateway {
    server: Arc<ServerTransport>,
    backing: Backing,
}

impl Gateway {
    pub fn single_backend(server: Arc<ServerTransport>, backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            server,
            backing: Backing::Single(backend),
        })
    }

    pub fn with_factory(
        server: Arc<ServerTransport>,
        create: Arc<dyn Fn(String) -> BridgeResult<Arc<dyn Backend>> + Send + Sync>,
        capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            backing: Backing::Factory {
                create,
                cache: Mutex::new(LruStore::new(capacity)),
                inflight: Mutex::new(HashMap::new()),
                inflight_gate: Semaphore::new(32),
            },
        })
    }

    async fn backend_for(self: &Arc<Self>, client_pubkey: &str) -> Option<Arc<dyn Backend>> {
        match &self.backing {
            Backing::Single(backend) => Some(backend.clone()),
            Backing::Factory {
                create,
                cache,
                inflight,
                inflight_gate,
            } => {
                if let Some(existing) = cache.lock().unwrap().get(&client_pubkey.to_string()) {
                    return Some(existing.clone());
                }

                let mut guard = inflight.lock().unwrap();
                if let Some(waiters) = guard.get_mut(client_pubkey) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    drop(guard);
                    return rx.await.ok().flatten();
                }
                guard.insert(client_pubkey.to_string(), Vec::new());
                drop(guard);

                let _permit = inflight_gate.acquire().await.ok()?;
                let created = create(client_pubkey.to_string()).ok();
                if let Some(backend) = &created {
                    if backend.clone().start().await.is_err() {
                        warn!(client_pubkey, "backend start failed");
                    } else if let Some(evicted) = cache
                        .lock()
                        .unwrap()
                        .insert(client_pubkey.to_string(), backend.clone())
                    {
                        let ev = evicted.value;
                        tokio::spawn(async move {
                            ev.terminate_session().await;
                            let _ = ev.close().await;
                        });
                    }
                }

                let waiters = inflight.lock().unwrap().remove(client_pubkey).unwrap_or_default();
                for tx in waiters {
                    let _ = tx.send(created.clone());
                }
                created
            }
        }
    }

    /// The raw forwarding callback, unwrapped by any payments middleware.
    /// Exposed so a caller that needs to sit `ServerPaymentsMiddleware`
    /// between the server transport and this gateway can wrap it before
    /// installing it, via [`Gateway::start_with_on_message`].
    pub fn forward_callback(self: &Arc<Self>) -> OnMessage {
        let this = self.clone();
        Arc::new(move |msg: JsonRpcMessage| {
            let this = this.clone();
            tokio::spawn(async move {
                this.forward(msg).await;
            });
        })
    }

    /// Wire the server transport's inbound messages to the appropriate
    /// backend. In factory mode, messages without a resolvable client
    /// pubkey (internal announcement traffic) are never forwarded.
    pub async fn start(self: &Arc<Self>) -> BridgeResult<()> {
        let on_message = self.forward_callback();
        self.start_with_on_message(on_message).await
    }

    /// Like [`Gateway::start`], but installs `on_message` as the server
    /// transport's callback instead of the raw forwarding closure — the seam
    /// a payments middleware wraps itself around (§4.P, §4.G).
    pub async fn start_with_on_message(self: &Arc<Self>, on_message: OnMessage) -> BridgeResult<()> {
        if let Backing::Single(backend) = &self.backing {
            backend.clone().start().await?;
        }
        if matches!(self.backing, Backing::Factory { .. }) {
            let this = self.clone();
            let on_evicted: OnClientSessionEvicted = Arc::new(move |client_pubkey| {
                this.evict_backend_for(&client_pubkey);
            });
            self.server.set_on_client_session_evicted(on_evicted);
        }
        self.server.set_on_message(on_message);
        self.server.clone().start().await
    }

    /// Tear down the cached backend for a client whose session the server
    /// transport just evicted (§4.V `onClientSessionEvicted`). A no-op in
    /// single-backend mode, where there is no per-client cache to prune.
    fn evict_backend_for(self: &Arc<Self>, client_pubkey: &str) {
        let Backing::Factory { cache, .. } = &self.backing else {
            return;
        };
        let Some(backend) = cache.lock().unwrap().remove(&client_pubkey.to_string()) else {
            return;
        };
        tokio::spawn(async move {
            backend.terminate_session().await;
            let _ = backend.clone().close().await;
        });
    }

    /// Route one inbound MCP message to its backend. Single-backend mode
    /// always has exactly one destination; factory mode looks the client
    /// pubkey up by the message's request id (the outer event id the
    /// server transport stamped it with) and drops messages with none —
    /// internal announcement traffic (§4.G, §4.V).
    async fn forward(self: &Arc<Self>, msg: JsonRpcMessage) {
        match &self.backing {
            Backing::Single(backend) => {
                let _ = backend.clone().send(msg).await;
            }
            Backing::Factory { .. } => {
                let Some(id) = request_id_str(&msg) else {
                    return;
                };
                let Some(client_pubkey) = self.server.route_client_pubkey(&id) else {
                    return;
                };
                let Some(backend) = self.backend_for(&client_pubkey).await else {
                    warn!(client_pubkey, "no backend available to forward to");
                    return;
                };
                let _ = backend.send(msg).await;
            }
        }
    }

    pub async fn stop(self: &Arc<Self>) -> BridgeResult<()> {
        self.server.clone().close().await?;
        match &self.backing {
            Backing::Single(backend) => {
                backend.terminate_session().await;
                backend.clone().close().await?;
            }
            Backing::Factory { cache, .. } => {
                let all = cache.lock().unwrap().drain_all();
                for (_, backend) in all {
                    backend.terminate_session().await;
                    let _ = backend.clone().close().await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthorizationPolicy;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::PrivateKeySigner;
    use crate::transport::server::ServerTransportConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        sends: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingBackend {
        async fn start(self: Arc<Self>) -> BridgeResult<()> {
            Ok(())
        }
        async fn send(self: Arc<Self>, _message: JsonRpcMessage) -> BridgeResult<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(self: Arc<Self>) -> BridgeResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for CountingBackend {}

    #[tokio::test]
    async fn single_backend_mode_starts_and_stops_cleanly() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        let authz = Arc::new(AuthorizationPolicy::new(None, vec![], false));
        let server = ServerTransport::new(signer, pool, authz, ServerTransportConfig::default());
        let backend = Arc::new(CountingBackend { sends: AtomicUsize::new(0) });
        let gateway = Gateway::single_backend(server, backend);
        gateway.start().await.unwrap();
        gateway.stop().await.unwrap();
    }
}
