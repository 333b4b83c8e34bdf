//! Client Transport (§4.C): speaks MCP to a single server identified by its
//! Nostr pubkey, correlating responses back to the request that produced
//! them and optionally emulating a stateless `initialize` handshake.

use super::base::BaseTransport;
use super::{OnClose, OnError, OnMessage, OnMessageWithContext, OriginalRequestContext, PendingRequest, Transport};
use crate::error::{BridgeError, BridgeResult};
use crate::event::codec::{decrypt_gift_wrap, event_content_to_mcp, policy_allows_inbound, EncryptionMode, GiftWrapMode};
use crate::event::{is_gift_wrap_kind, tag, Event, INBOUND_KINDS, KIND_APPLICATION_MESSAGE};
use crate::jsonrpc::JsonRpcMessage;
use crate::lru_store::LruStore;
use crate::relay::{Filter, RelayPool};
use crate::signer::Signer;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const DEFAULT_CORRELATION_CAPACITY: usize = 10_000;
pub const DEFAULT_SEEN_EVENT_IDS_CAPACITY: usize = 10_000;

pub struct ClientTransportConfig {
    pub server_pubkey: String,
    pub is_stateless: bool,
    pub strict_ephemeral: bool,
    pub encryption_mode: EncryptionMode,
    pub gift_wrap_mode: GiftWrapMode,
}

pub struct ClientTransport {
    base: BaseTransport,
    config: ClientTransportConfig,
    client_pmis: Mutex<Vec<String>>,
    correlation: Mutex<LruStore<String, PendingRequest>>,
    progress_index: Mutex<LruStore<String, String>>,
    seen_event_ids: Mutex<LruStore<String, ()>>,
    server_advertises_ephemeral: Mutex<bool>,
    recorded_initialize_event: Mutex<Option<Event>>,
    on_message: Mutex<Option<OnMessage>>,
    on_message_with_context: Mutex<Option<OnMessageWithContext>>,
    on_error: Mutex<Option<OnError>>,
    on_close: Mutex<Option<OnClose>>,
}

impl ClientTransport {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay_pool: Arc<dyn RelayPool>,
        config: ClientTransportConfig,
    ) -> Arc<Self> {
        let base = BaseTransport::new(
            signer,
            relay_pool,
            config.encryption_mode,
            config.gift_wrap_mode,
        );
        Arc::new(Self {
            base,
            config,
            client_pmis: Mutex::new(Vec::new()),
            correlation: Mutex::new(LruStore::new(DEFAULT_CORRELATION_CAPACITY)),
            progress_index: Mutex::new(LruStore::new(DEFAULT_CORRELATION_CAPACITY)),
            seen_event_ids: Mutex::new(LruStore::new(DEFAULT_SEEN_EVENT_IDS_CAPACITY)),
            server_advertises_ephemeral: Mutex::new(false),
            recorded_initialize_event: Mutex::new(None),
            on_message: Mutex::new(None),
            on_message_with_context: Mutex::new(None),
            on_error: Mutex::new(None),
            on_close: Mutex::new(None),
        })
    }

    pub fn set_on_message(&self, f: OnMessage) {
        *self.on_message.lock().unwrap() = Some(f);
    }
    pub fn set_on_message_with_context(&self, f: OnMessageWithContext) {
        *self.on_message_with_context.lock().unwrap() = Some(f);
    }
    pub fn set_on_error(&self, f: OnError) {
        *self.on_error.lock().unwrap() = Some(f);
    }
    pub fn set_on_close(&self, f: OnClose) {
        *self.on_close.lock().unwrap() = Some(f);
    }

    /// Injected by the payments wrapper (§4.Q) to announce PMI preference.
    pub fn set_client_pmis(&self, pmis: Vec<String>) {
        *self.client_pmis.lock().unwrap() = pmis;
    }

    /// Peek (without consuming) the pending request registered under a
    /// correlation id, so the payments wrapper can find the original
    /// request's progress token without racing the eventual response
    /// (§4.Q synthetic progress).
    pub fn pending_request(&self, correlated_event_id: &str) -> Option<PendingRequest> {
        self.correlation.lock().unwrap().peek(&correlated_event_id.to_string()).cloned()
    }

    fn emit_message(&self, msg: JsonRpcMessage) {
        if let Some(cb) = self.on_message.lock().unwrap().clone() {
            cb(msg);
        }
    }

    fn emit_message_with_context(&self, msg: JsonRpcMessage, ctx: OriginalRequestContext) {
        if let Some(cb) = self.on_message_with_context.lock().unwrap().clone() {
            cb(msg, ctx);
        }
    }

    fn emit_error(&self, err: BridgeError) {
        if let Some(cb) = self.on_error.lock().unwrap().clone() {
            cb(err);
        }
    }

    fn handle_inbound(self: &Arc<Self>, event: Event) {
        if is_gift_wrap_kind(event.kind) {
            if !policy_allows_inbound(self.config.encryption_mode, true) {
                warn!(event_id = %event.id, "dropping gift-wrap under DISABLED encryption policy");
                return;
            }
            if self
                .seen_event_ids
                .lock()
                .unwrap()
                .contains(&event.id)
            {
                return; // duplicate delivery across relays
            }
            self.seen_event_ids.lock().unwrap().insert(event.id.clone(), ());

            let this = self.clone();
            let outer = event.clone();
            tokio::spawn(async move {
                let signer = this.base.signer.clone();
                match tokio::time::timeout(std::time::Duration::from_secs(10), decrypt_gift_wrap(&outer, signer.as_ref())).await {
                    Ok(Ok(inner)) => this.handle_decrypted_inbound(inner),
                    Ok(Err(e)) => this.emit_error(e),
                    Err(_) => this.emit_error(BridgeError::DecryptFailed),
                }
            });
            return;
        }

        if !policy_allows_inbound(self.config.encryption_mode, false) {
            warn!(event_id = %event.id, "dropping plaintext event under REQUIRED encryption policy");
            return;
        }
        self.handle_decrypted_inbound(event);
    }

    fn handle_decrypted_inbound(self: &Arc<Self>, event: Event) {
        if event.pubkey != self.config.server_pubkey {
            warn!(event_id = %event.id, "dropping event from unexpected pubkey");
            return;
        }

        let correlated = event.correlated_event_id().map(str::to_string);

        let msg = match event_content_to_mcp(&event, crate::event::codec::DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(m) => m,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "malformed inbound content");
                self.emit_error(e);
                return;
            }
        };

        match &msg {
            JsonRpcMessage::Response(_) => {
                let Some(correlated_id) = correlated.clone() else {
                    warn!(event_id = %event.id, "response without correlation e-tag");
                    return;
                };
                let pending = self.correlation.lock().unwrap().remove(&correlated_id);
                let Some(pending) = pending else {
                    warn!(correlated_id, "response for unknown or already-resolved request");
                    return;
                };
                if let Some(tok) = &pending.progress_token {
                    self.progress_index.lock().unwrap().remove(tok);
                }
                if pending.is_initialize {
                    *self.recorded_initialize_event.lock().unwrap() = Some(event.clone());
                    if event.find_tag_value("gw") == Some("ephemeral") {
                        *self.server_advertises_ephemeral.lock().unwrap() = true;
                    }
                }
                let restored = restore_response_id(msg, pending.original_request_id.clone());
                self.emit_message(restored.clone());
                self.emit_message_with_context(
                    restored,
                    OriginalRequestContext {
                        event_id: event.id.clone(),
                        correlated_event_id: Some(correlated_id),
                        client_pubkey: None,
                    },
                );
            }
            JsonRpcMessage::Notification(_) => {
                self.emit_message(msg.clone());
                self.emit_message_with_context(
                    msg,
                    OriginalRequestContext {
                        event_id: event.id.clone(),
                        correlated_event_id: correlated,
                        client_pubkey: None,
                    },
                );
            }
            JsonRpcMessage::Request(_) => {
                warn!(event_id = %event.id, "dropping unexpected inbound request on client transport");
            }
        }
    }

    fn stateless_initialize_response(id: serde_json::Value) -> JsonRpcMessage {
        let result = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {"name": "stateless-bridge", "version": "0.1.0"},
            "capabilities": {
                "tools": {"listChanged": true},
                "prompts": {"listChanged": true},
                "resources": {"listChanged": true, "subscribe": true},
            }
        });
        JsonRpcMessage::Response(crate::jsonrpc::JsonRpcResponse {
            jsonrpc: crate::jsonrpc::JsonRpcVersion,
            id,
            payload: crate::jsonrpc::JsonRpcResponsePayload::Result { result },
        })
    }
}

fn restore_response_id(msg: JsonRpcMessage, original_id: serde_json::Value) -> JsonRpcMessage {
    match msg {
        JsonRpcMessage::Response(mut r) => {
            r.id = original_id;
            JsonRpcMessage::Response(r)
        }
        other => other,
    }
}

#[async_trait::async_trait]
impl Transport for ClientTransport {
    async fn start(self: Arc<Self>) -> BridgeResult<()> {
        self.base.connect().await?;
        let own_pubkey = self.base.signer.get_public_key();
        let filter = Filter::new()
            .kinds(INBOUND_KINDS)
            .p_tag(own_pubkey)
            .since(chrono::Utc::now().timestamp());
        let this = self.clone();
        self.base
            .subscribe(vec![filter], move |event| this.handle_inbound(event), None)
            .await;
        Ok(())
    }

    async fn send(self: Arc<Self>, message: JsonRpcMessage) -> BridgeResult<()> {
        if self.config.is_stateless {
            if message.method() == Some("notifications/initialized") {
                return Ok(()); // swallowed (§4.C statelessness)
            }
            if message.method() == Some("initialize") {
                if let JsonRpcMessage::Request(req) = &message {
                    let id = req.id.clone();
                    let on_message = self.on_message.lock().unwrap().clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await; // deliver asynchronously, like a microtask
                        if let Some(cb) = on_message {
                            cb(ClientTransport::stateless_initialize_response(id));
                        }
                    });
                    return Ok(());
                }
            }
        }

        let mut tags = vec![tag("p", &self.config.server_pubkey)];
        for pmi in self.client_pmis.lock().unwrap().iter() {
            tags.push(tag("pmi", pmi));
        }
        let ephemeral = self.config.strict_ephemeral || *self.server_advertises_ephemeral.lock().unwrap();
        let encrypted = !matches!(self.config.encryption_mode, EncryptionMode::Disabled);

        let is_request = message.is_request();
        let is_initialize = message.method() == Some("initialize");
        let progress_token = message.progress_token();
        let method = message.method().map(str::to_string);
        let capability = method
            .as_deref()
            .and_then(|m| crate::jsonrpc::capability_identifier(m, message.params()));
        let original_request_id = match &message {
            JsonRpcMessage::Request(r) => Some(r.id.clone()),
            _ => None,
        };

        let correlation = &self.correlation;
        let progress_index = &self.progress_index;
        self.base
            .send_mcp_message(&message, &self.config.server_pubkey, KIND_APPLICATION_MESSAGE, ephemeral, tags, encrypted, |inner_id| {
                if is_request {
                    if let Some(original_request_id) = original_request_id {
                        correlation.lock().unwrap().insert(
                            inner_id.to_string(),
                            PendingRequest {
                                original_request_id,
                                is_initialize,
                                progress_token: progress_token.clone(),
                                client_pubkey: None,
                                method: method.clone(),
                                capability: capability.clone(),
                            },
                        );
                        if let Some(tok) = progress_token {
                            progress_index.lock().unwrap().insert(tok, inner_id.to_string());
                        }
                    }
                }
            })
            .await
    }

    async fn close(self: Arc<Self>) -> BridgeResult<()> {
        self.base.unsubscribe_all().await;
        self.base.disconnect().await?;
        self.correlation.lock().unwrap().drain_all();
        self.seen_event_ids.lock().unwrap().drain_all();
        if let Some(cb) = self.on_close.lock().unwrap().clone() {
            cb();
        }
        Ok(())
    }
}

impl ClientTransport {
    pub fn recorded_initialize_event(&self) -> Option<Event> {
        self.recorded_initialize_event.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_APPLICATION_MESSAGE;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::PrivateKeySigner;
    use std::sync::Mutex as StdMutex;

    fn config(server_pubkey: String) -> ClientTransportConfig {
        ClientTransportConfig {
            server_pubkey,
            is_stateless: false,
            strict_ephemeral: false,
            encryption_mode: EncryptionMode::Disabled,
            gift_wrap_mode: GiftWrapMode::Auto,
        }
    }

    #[tokio::test]
    async fn send_registers_correlation_before_publish_completes() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let server = PrivateKeySigner::generate();
        let pool = FakeRelayPool::new();
        let client = ClientTransport::new(signer, pool.clone(), config(server.get_public_key()));
        let req = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#).unwrap();
        client.clone().send(req).await.unwrap();
        assert_eq!(pool.published_events().len(), 1);
        assert_eq!(client.correlation.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stateless_initialize_is_synthesized_without_publishing() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let server = PrivateKeySigner::generate();
        let pool = FakeRelayPool::new();
        let mut cfg = config(server.get_public_key());
        cfg.is_stateless = true;
        let client = ClientTransport::new(signer, pool.clone(), cfg);

        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        client.set_on_message(Arc::new(move |m| *received2.lock().unwrap() = Some(m)));

        let req = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).unwrap();
        client.clone().send(req).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(pool.published_events().is_empty());
        let got = received.lock().unwrap().take().expect("synthesized response");
        assert!(matches!(got, JsonRpcMessage::Response(_)));
    }

    #[tokio::test]
    async fn response_without_correlation_is_dropped() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let server = PrivateKeySigner::generate();
        let pool = FakeRelayPool::new();
        let client = ClientTransport::new(signer, pool.clone(), config(server.get_public_key()));

        let received = Arc::new(StdMutex::new(0usize));
        let received2 = received.clone();
        client.set_on_message(Arc::new(move |_| {
            *received2.lock().unwrap() += 1;
        }));

        let event = Event {
            id: "unknown-correlation".into(),
            pubkey: server.get_public_key(),
            created_at: 0,
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("e", "no-such-request")],
            content: r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string(),
            sig: String::new(),
        };
        client.handle_inbound(event);
        assert_eq!(*received.lock().unwrap(), 0);
    }
}
