//! Production `RelayPool`: real WebSocket connections to each configured
//! relay URL, filter-replaying subscriptions, retrying publish, and
//! liveness-triggered single-flight rebuilds.
//!
//! Grounded on `daemon/src/relay/mod.rs` (`relay_loop`, `sleep_backoff`,
//! `tokio::select!`-driven inbound/outbound multiplexing), generalized from
//! one control-plane socket to N relay sockets.

use super::backoff::Backoff;
use super::{Filter, OnEose, OnEvent, RelayPool, RelayPoolConfig, Subscription};
use crate::error::{BridgeError, BridgeResult};
use crate::event::Event;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct SubDescriptor {
    filters: Vec<Filter>,
    on_event: OnEvent,
    on_eose: Option<OnEose>,
}

struct Shared {
    config: RelayPoolConfig,
    subs: Mutex<HashMap<String, SubDescriptor>>,
    links: Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
    ok_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<bool>>>>,
    eose_waiters: Mutex<HashMap<String, oneshot::Sender<()>>>,
    generation: AtomicU64,
    rebuilding: AtomicBool,
    shutdown: CancellationToken,
}

pub struct WsRelayPool {
    shared: Arc<Shared>,
}

impl WsRelayPool {
    pub fn new(config: RelayPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                config,
                subs: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                ok_waiters: Mutex::new(HashMap::new()),
                eose_waiters: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                rebuilding: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    fn spawn_links(self: &Arc<Self>) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        for url in self.shared.config.urls.clone() {
            let shared = self.shared.clone();
            tokio::spawn(relay_link_task(url, shared, generation));
        }
        self.maybe_spawn_liveness();
    }

    fn maybe_spawn_liveness(self: &Arc<Self>) {
        let shared = self.shared.clone();
        let pool = self.clone();
        tokio::spawn(async move {
            liveness_loop(pool, shared).await;
        });
    }

    async fn rebuild(self: &Arc<Self>) {
        if self
            .shared
            .rebuilding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // rebuild already in progress: single-flight (§4.R)
        }
        info!("relay pool rebuild triggered by liveness failure");
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.links.lock().unwrap().clear();
        let generation = self.shared.generation.load(Ordering::SeqCst);
        for url in self.shared.config.urls.clone() {
            let shared = self.shared.clone();
            tokio::spawn(relay_link_task(url, shared, generation));
        }
        self.shared.rebuilding.store(false, Ordering::SeqCst);
    }
}

async fn liveness_loop(pool: Arc<WsRelayPool>, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(shared.config.ping_frequency) => {}
        }
        if shared.subs.lock().unwrap().is_empty() {
            continue;
        }
        let probe_id = format!("liveness-{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        shared.eose_waiters.lock().unwrap().insert(probe_id.clone(), tx);
        send_req(&shared, &probe_id, &[Filter::new().limit(0)]);
        let ok = tokio::time::timeout(shared.config.ping_timeout, rx).await.is_ok();
        shared.eose_waiters.lock().unwrap().remove(&probe_id);
        if !ok {
            warn!("relay pool liveness probe timed out, rebuilding");
            pool.rebuild().await;
        }
    }
}

fn send_req(shared: &Arc<Shared>, sub_id: &str, filters: &[Filter]) {
    let mut frame = vec![Value::String("REQ".into()), Value::String(sub_id.to_string())];
    for f in filters {
        frame.push(serde_json::to_value(f).unwrap_or(Value::Null));
    }
    let text = Value::Array(frame).to_string();
    for tx in shared.links.lock().unwrap().values() {
        let _ = tx.send(WsMessage::Text(text.clone()));
    }
}

async fn relay_link_task(url: String, shared: Arc<Shared>, generation: u64) {
    let mut backoff = Backoff::new(
        shared.config.reconnect_base_delay_ms,
        shared.config.reconnect_max_delay_ms,
    );
    loop {
        if shared.shutdown.is_cancelled() || shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                backoff.reset();
                info!(relay = %url, "relay connected");
                let (mut write, mut read) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
                shared.links.lock().unwrap().insert(url.clone(), out_tx.clone());

                // Replay all active subscriptions against the fresh socket.
                let replay: Vec<(String, Vec<Filter>)> = shared
                    .subs
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(id, d)| (id.clone(), d.filters.clone()))
                    .collect();
                for (sub_id, filters) in replay {
                    let mut frame = vec![Value::String("REQ".into()), Value::String(sub_id)];
                    for f in &filters {
                        frame.push(serde_json::to_value(f).unwrap_or(Value::Null));
                    }
                    let _ = out_tx.send(WsMessage::Text(Value::Array(frame).to_string()));
                }

                let writer = tokio::spawn(async move {
                    while let Some(msg) = out_rx.recv().await {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                loop {
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        msg = read.next() => {
                            match msg {
                                Some(Ok(WsMessage::Text(text))) => handle_inbound(&shared, &text),
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(relay = %url, error = %e, "relay read error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    }
                }
                writer.abort();
                shared.links.lock().unwrap().remove(&url);
                debug!(relay = %url, "relay disconnected, will reconnect");
            }
            Err(e) => {
                warn!(relay = %url, error = %e, "relay connect failed");
            }
        }
        if shared.shutdown.is_cancelled() || shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

fn handle_inbound(shared: &Arc<Shared>, text: &str) {
    let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(tag) = frame.first().and_then(Value::as_str) else {
        return;
    };
    match tag {
        "EVENT" => {
            let (Some(sub_id), Some(event_val)) = (frame.get(1).and_then(Value::as_str), frame.get(2)) else {
                return;
            };
            let Ok(event): Result<Event, _> = serde_json::from_value(event_val.clone()) else {
                return;
            };
            let on_event = shared
                .subs
                .lock()
                .unwrap()
                .get(sub_id)
                .map(|d| d.on_event.clone());
            if let Some(cb) = on_event {
                cb(event);
            }
        }
        "EOSE" => {
            let Some(sub_id) = frame.get(1).and_then(Value::as_str) else {
                return;
            };
            if let Some(tx) = shared.eose_waiters.lock().unwrap().remove(sub_id) {
                let _ = tx.send(());
            }
            let on_eose = shared
                .subs
                .lock()
                .unwrap()
                .get(sub_id)
                .and_then(|d| d.on_eose.clone());
            if let Some(cb) = on_eose {
                cb();
            }
        }
        "OK" => {
            let (Some(event_id), accepted) = (
                frame.get(1).and_then(Value::as_str),
                frame.get(2).and_then(Value::as_bool).unwrap_or(false),
            ) else {
                return;
            };
            if let Some(waiters) = shared.ok_waiters.lock().unwrap().remove(event_id) {
                for tx in waiters {
                    let _ = tx.send(accepted);
                }
            }
        }
        "NOTICE" => {
            if let Some(msg) = frame.get(1).and_then(Value::as_str) {
                warn!(notice = %msg, "relay NOTICE");
            }
        }
        _ => {}
    }
}

#[async_trait]
impl RelayPool for WsRelayPool {
    async fn connect(self: Arc<Self>) {
        self.spawn_links();
    }

    async fn disconnect(self: Arc<Self>) {
        self.shared.shutdown.cancel();
        self.shared.links.lock().unwrap().clear();
    }

    async fn publish(self: Arc<Self>, event: Event, cancel: CancellationToken) -> BridgeResult<()> {
        let mut backoff = Backoff::new(
            self.shared.config.publish_retry_base_delay_ms,
            self.shared.config.publish_retry_cap_delay_ms,
        );
        let text = {
            let frame = serde_json::json!(["EVENT", event]);
            frame.to_string()
        };
        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::PublishFailed("aborted".into()));
            }
            let (tx, rx) = oneshot::channel();
            self.shared
                .ok_waiters
                .lock()
                .unwrap()
                .entry(event.id.clone())
                .or_default()
                .push(tx);

            let links: Vec<_> = self.shared.links.lock().unwrap().values().cloned().collect();
            for link in &links {
                let _ = link.send(WsMessage::Text(text.clone()));
            }

            if !links.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::PublishFailed("aborted".into())),
                    result = tokio::time::timeout(std::time::Duration::from_secs(10), rx) => {
                        if let Ok(Ok(true)) = result {
                            return Ok(());
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::PublishFailed("aborted".into())),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    async fn subscribe(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        on_event: OnEvent,
        on_eose: Option<OnEose>,
    ) -> Subscription {
        let id = Uuid::new_v4().to_string();
        self.shared.subs.lock().unwrap().insert(
            id.clone(),
            SubDescriptor {
                filters: filters.clone(),
                on_event,
                on_eose,
            },
        );
        send_req(&self.shared, &id, &filters);
        Subscription {
            id,
            pool: self.clone() as Arc<dyn RelayPool>,
        }
    }

    async fn unsubscribe(&self, sub_id: &str) {
        if self.shared.subs.lock().unwrap().remove(sub_id).is_none() {
            return; // idempotent (§4.R)
        }
        let text = serde_json::json!(["CLOSE", sub_id]).to_string();
        for link in self.shared.links.lock().unwrap().values() {
            let _ = link.send(WsMessage::Text(text.clone()));
        }
    }

    fn relay_urls(&self) -> Vec<String> {
        self.shared.config.urls.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_serializes_expected_shape() {
        let shared = Shared {
            config: RelayPoolConfig::default(),
            subs: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            ok_waiters: Mutex::new(HashMap::new()),
            eose_waiters: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            rebuilding: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        };
        let shared = Arc::new(shared);
        // send_req with no links just shouldn't panic.
        send_req(&shared, "sub1", &[Filter::new().kinds([1u16])]);
    }
}
