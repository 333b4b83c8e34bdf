//! Server Transport (§4.V): speaks MCP on behalf of one server identity to
//! many clients, routing each response back to the client and request it
//! belongs to, and — for public servers — announcing capabilities.

use super::base::BaseTransport;
use super::{OnClientSessionEvicted, OnClose, OnError, OnMessage, ShouldEvictSession, Transport};
use crate::authz::{AuthorizationPolicy, AuthzDecision};
use crate::error::{BridgeError, BridgeResult};
use crate::event::codec::{decrypt_gift_wrap, event_content_to_mcp, policy_allows_inbound, EncryptionMode, GiftWrapMode};
use crate::event::{
    is_gift_wrap_kind, tag, Event, Tag, INBOUND_KINDS, KIND_APPLICATION_MESSAGE, KIND_DELETION, KIND_PROMPTS_LIST,
    KIND_RESOURCES_LIST, KIND_RESOURCE_TEMPLATES_LIST, KIND_TOOLS_LIST,
};
use crate::jsonrpc::{notification, synthetic_error_response, JsonRpcMessage, MSG_UNAUTHORIZED};
use crate::lru_store::LruStore;
use crate::relay::{Filter, RelayPool};
use crate::signer::Signer;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

pub const DEFAULT_SESSION_STORE_CAPACITY: usize = 10_000;
pub const DEFAULT_ROUTE_STORE_CAPACITY: usize = 10_000;
pub const DEFAULT_ANNOUNCEMENT_TIMEOUT: Duration = Duration::from_secs(10);
const ANNOUNCEMENT_ID: &str = "announcement";

#[derive(Debug, Clone)]
pub struct ServerSession {
    pub client_pubkey: String,
    pub last_activity: i64,
    pub is_encrypted: bool,
    pub is_initialized: bool,
}

#[derive(Debug, Clone)]
struct RouteEntry {
    client_pubkey: String,
    original_request_id: Value,
    progress_token: Option<String>,
    client_pmis: Vec<String>,
    published: bool,
}

pub struct ServerTransportConfig {
    pub server_info: Option<Value>,
    pub is_public_server: bool,
    pub encryption_mode: EncryptionMode,
    pub gift_wrap_mode: GiftWrapMode,
    pub profile_tags: Vec<Tag>,
    pub announcement_timeout: Duration,
    /// Refuses eviction of a session the bounded session store wants to drop
    /// (e.g. it still has requests in flight); `None` never refuses (§4.V).
    pub should_evict_session: Option<ShouldEvictSession>,
}

impl Default for ServerTransportConfig {
    fn default() -> Self {
        Self {
            server_info: None,
            is_public_server: false,
            encryption_mode: EncryptionMode::Optional,
            gift_wrap_mode: GiftWrapMode::Auto,
            profile_tags: vec![],
            announcement_timeout: DEFAULT_ANNOUNCEMENT_TIMEOUT,
            should_evict_session: None,
        }
    }
}

pub struct ServerTransport {
    base: BaseTransport,
    config: ServerTransportConfig,
    authz: Arc<AuthorizationPolicy>,
    sessions: Mutex<LruStore<String, ServerSession>>,
    routes: Mutex<LruStore<String, RouteEntry>>,
    progress_index: Mutex<LruStore<String, String>>,
    seen_inner_ids: Mutex<LruStore<String, ()>>,
    announcement_waiter: Mutex<Option<oneshot::Sender<JsonRpcMessage>>>,
    is_announcement_initialized: Mutex<bool>,
    on_message: Mutex<Option<OnMessage>>,
    on_error: Mutex<Option<OnError>>,
    on_close: Mutex<Option<OnClose>>,
    on_client_session_evicted: Mutex<Option<OnClientSessionEvicted>>,
}

impl ServerTransport {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay_pool: Arc<dyn RelayPool>,
        authz: Arc<AuthorizationPolicy>,
        config: ServerTransportConfig,
    ) -> Arc<Self> {
        let base = BaseTransport::new(signer, relay_pool, config.encryption_mode, config.gift_wrap_mode);
        Arc::new(Self {
            base,
            config,
            authz,
            sessions: Mutex::new(LruStore::new(DEFAULT_SESSION_STORE_CAPACITY)),
            routes: Mutex::new(LruStore::new(DEFAULT_ROUTE_STORE_CAPACITY)),
            progress_index: Mutex::new(LruStore::new(DEFAULT_ROUTE_STORE_CAPACITY)),
            seen_inner_ids: Mutex::new(LruStore::new(DEFAULT_ROUTE_STORE_CAPACITY)),
            announcement_waiter: Mutex::new(None),
            is_announcement_initialized: Mutex::new(false),
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
            on_close: Mutex::new(None),
            on_client_session_evicted: Mutex::new(None),
        })
    }

    pub fn set_on_message(&self, f: OnMessage) {
        *self.on_message.lock().unwrap() = Some(f);
    }
    pub fn set_on_error(&self, f: OnError) {
        *self.on_error.lock().unwrap() = Some(f);
    }
    pub fn set_on_close(&self, f: OnClose) {
        *self.on_close.lock().unwrap() = Some(f);
    }
    /// Install the callback the gateway uses to tear down a per-client
    /// backend when its session is evicted from the bounded session store.
    pub fn set_on_client_session_evicted(&self, f: OnClientSessionEvicted) {
        *self.on_client_session_evicted.lock().unwrap() = Some(f);
    }

    fn emit_message(&self, msg: JsonRpcMessage) {
        if let Some(cb) = self.on_message.lock().unwrap().clone() {
            cb(msg);
        }
    }

    fn emit_error(&self, err: BridgeError) {
        if let Some(cb) = self.on_error.lock().unwrap().clone() {
            cb(err);
        }
    }

    pub fn session(&self, client_pubkey: &str) -> Option<ServerSession> {
        self.sessions.lock().unwrap().peek(&client_pubkey.to_string()).cloned()
    }

    /// Outer gift-wrap kind this server addresses clients with, per its own
    /// configured `gift_wrap_mode` (§4.S) — the server side has no per-peer
    /// negotiation the way `ClientTransport` does against what a server
    /// advertises, so this is fixed at construction.
    fn gift_wrap_ephemeral(&self) -> bool {
        matches!(self.config.gift_wrap_mode, GiftWrapMode::Ephemeral)
    }

    /// Run `shouldEvictSession` against a session the LRU store just pushed
    /// out; a refusal re-inserts it, otherwise fires `onClientSessionEvicted`
    /// (§4.V).
    fn handle_session_eviction(&self, client_pubkey: String, session: ServerSession) {
        if let Some(predicate) = &self.config.should_evict_session {
            if !predicate(&session) {
                if let Some(re_evicted) = self.sessions.lock().unwrap().insert(client_pubkey, session) {
                    warn!(client_pubkey = %re_evicted.key, "session eviction refused but store is still over capacity");
                    self.handle_session_eviction(re_evicted.key, re_evicted.value);
                }
                return;
            }
        }
        if let Some(cb) = self.on_client_session_evicted.lock().unwrap().clone() {
            cb(client_pubkey);
        }
    }

    /// Which client a pending request (by its outer event id, the id every
    /// inbound `JsonRpcMessage::Request` is stamped with) belongs to. Used
    /// by the gateway in per-client factory mode to route `onmessage`
    /// traffic; `None` for ids with no registered route (e.g. the
    /// reserved `"announcement"` id), which the gateway must not forward.
    pub fn route_client_pubkey(&self, event_id: &str) -> Option<String> {
        self.routes.lock().unwrap().peek(&event_id.to_string()).map(|r| r.client_pubkey.clone())
    }

    /// Ordered `pmi` tag preferences the client attached to this pending
    /// request, as captured at registration time. Empty when the request's
    /// event carried none, or when `event_id` has no registered route.
    pub fn route_client_pmis(&self, event_id: &str) -> Vec<String> {
        self.routes
            .lock()
            .unwrap()
            .peek(&event_id.to_string())
            .map(|r| r.client_pmis.clone())
            .unwrap_or_default()
    }

    /// Public helper used by the payments middleware (§4.P) to send a
    /// notification correlated to an existing request without going
    /// through the response-routing path.
    pub async fn send_notification(
        &self,
        client_pubkey: &str,
        notification: JsonRpcMessage,
        correlated_event_id: Option<&str>,
    ) -> BridgeResult<()> {
        let mut tags = vec![tag("p", client_pubkey)];
        if let Some(id) = correlated_event_id {
            tags.push(tag("e", id));
        }
        let is_encrypted = self
            .sessions
            .lock()
            .unwrap()
            .peek(&client_pubkey.to_string())
            .map(|s| s.is_encrypted)
            .unwrap_or(!matches!(self.config.encryption_mode, EncryptionMode::Disabled));
        self.base
            .send_mcp_message(
                &notification,
                client_pubkey,
                KIND_APPLICATION_MESSAGE,
                self.gift_wrap_ephemeral(),
                tags,
                is_encrypted,
                |_| {},
            )
            .await
    }

    fn handle_inbound(self: &Arc<Self>, event: Event) {
        if is_gift_wrap_kind(event.kind) {
            if !policy_allows_inbound(self.config.encryption_mode, true) {
                return;
            }
            let this = self.clone();
            tokio::spawn(async move {
                let signer = this.base.signer.clone();
                match tokio::time::timeout(Duration::from_secs(10), decrypt_gift_wrap(&event, signer.as_ref())).await {
                    Ok(Ok(inner)) => this.handle_decrypted_inbound(inner, true),
                    Ok(Err(e)) => this.emit_error(e),
                    Err(_) => this.emit_error(BridgeError::DecryptFailed),
                }
            });
            return;
        }
        if !policy_allows_inbound(self.config.encryption_mode, false) {
            return;
        }
        self.handle_decrypted_inbound(event, false);
    }

    fn handle_decrypted_inbound(self: &Arc<Self>, event: Event, was_encrypted: bool) {
        if self.seen_inner_ids.lock().unwrap().contains(&event.id) {
            return; // same inner request delivered via two envelopes
        }
        self.seen_inner_ids.lock().unwrap().insert(event.id.clone(), ());

        let msg = match event_content_to_mcp(&event, crate::event::codec::DEFAULT_MAX_MESSAGE_BYTES) {
            Ok(m) => m,
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "malformed inbound content");
                return;
            }
        };

        let client_pubkey = event.pubkey.clone();
        match self.authz.decide(&client_pubkey, &msg) {
            AuthzDecision::Allow => {}
            AuthzDecision::DenySilently => return,
            AuthzDecision::DenyWithUnauthorized => {
                if let JsonRpcMessage::Request(req) = &msg {
                    let this = self.clone();
                    let id = req.id.clone();
                    let client = client_pubkey.clone();
                    let event_id = event.id.clone();
                    tokio::spawn(async move {
                        let err = synthetic_error_response(id, MSG_UNAUTHORIZED, None);
                        let _ = this.send_notification(&client, err, Some(&event_id)).await;
                    });
                }
                return;
            }
        }

        let now = chrono::Utc::now().timestamp();
        let evicted = {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .get(&client_pubkey)
                .cloned()
                .unwrap_or(ServerSession {
                    client_pubkey: client_pubkey.clone(),
                    last_activity: now,
                    is_encrypted: was_encrypted,
                    is_initialized: false,
                });
            sessions.insert(
                client_pubkey.clone(),
                ServerSession {
                    last_activity: now,
                    is_encrypted: was_encrypted,
                    ..session
                },
            )
        };
        if let Some(evicted) = evicted {
            self.handle_session_eviction(evicted.key, evicted.value);
        }

        match msg {
            JsonRpcMessage::Request(mut req) => {
                let original_id = req.id.clone();
                let progress_token = JsonRpcMessage::Request(req.clone()).progress_token();
                req.id = Value::String(event.id.clone());
                self.routes.lock().unwrap().insert(
                    event.id.clone(),
                    RouteEntry {
                        client_pubkey,
                        original_request_id: original_id,
                        progress_token: progress_token.clone(),
                        client_pmis: event.pmi_preferences(),
                        published: false,
                    },
                );
                if let Some(tok) = progress_token {
                    self.progress_index.lock().unwrap().insert(tok, event.id.clone());
                }
                self.emit_message(JsonRpcMessage::Request(req));
            }
            JsonRpcMessage::Notification(n) => {
                if n.method == "notifications/initialized" {
                    let mut sessions = self.sessions.lock().unwrap();
                    if let Some(session) = sessions.get(&client_pubkey).cloned() {
                        sessions.insert(
                            client_pubkey,
                            ServerSession {
                                is_initialized: true,
                                ..session
                            },
                        );
                    }
                }
                self.emit_message(JsonRpcMessage::Notification(n));
            }
            JsonRpcMessage::Response(_) => {
                warn!(event_id = %event.id, "dropping unexpected inbound response on server transport");
            }
        }
    }

    async fn run_announcement_handshake(self: Arc<Self>) {
        let init_request = JsonRpcMessage::Request(crate::jsonrpc::JsonRpcRequest {
            jsonrpc: crate::jsonrpc::JsonRpcVersion,
            id: Value::String(ANNOUNCEMENT_ID.to_string()),
            method: "initialize".to_string(),
            params: None,
        });
        let Some(init_response) = self.await_announcement(init_request).await else {
            warn!("announcement initialize timed out, proceeding with capability listing anyway");
            self.publish_capability_lists().await;
            return;
        };
        if let JsonRpcMessage::Response(crate::jsonrpc::JsonRpcResponse {
            payload: crate::jsonrpc::JsonRpcResponsePayload::Result { .. },
            ..
        }) = init_response
        {
            *self.is_announcement_initialized.lock().unwrap() = true;
            self.emit_message(notification("notifications/initialized", Value::Null));
        }
        self.publish_capability_lists().await;
    }

    async fn await_announcement(self: &Arc<Self>, request: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let (tx, rx) = oneshot::channel();
        *self.announcement_waiter.lock().unwrap() = Some(tx);
        self.emit_message(request);
        tokio::time::timeout(self.config.announcement_timeout, rx).await.ok()?.ok()
    }

    async fn publish_capability_lists(self: &Arc<Self>) {
        let listings: [(&str, u16); 4] = [
            ("tools/list", KIND_TOOLS_LIST),
            ("resources/list", KIND_RESOURCES_LIST),
            ("resourceTemplates/list", KIND_RESOURCE_TEMPLATES_LIST),
            ("prompts/list", KIND_PROMPTS_LIST),
        ];
        for (method, kind) in listings {
            let request = JsonRpcMessage::Request(crate::jsonrpc::JsonRpcRequest {
                jsonrpc: crate::jsonrpc::JsonRpcVersion,
                id: Value::String(ANNOUNCEMENT_ID.to_string()),
                method: method.to_string(),
                params: None,
            });
            let Some(response) = self.await_announcement(request).await else {
                warn!(method, "announcement capability listing timed out");
                continue;
            };
            let own_pubkey = self.base.signer.get_public_key();
            let _ = self
                .base
                .send_mcp_message(&response, &own_pubkey, kind, false, self.config.profile_tags.clone(), false, |_| {})
                .await;
        }
    }

    /// Query the relay for this server's own announcement events and
    /// publish a deletion (kind 5) referencing them.
    pub async fn delete_announcement(self: &Arc<Self>, reason: &str) -> BridgeResult<HashSet<String>> {
        let own_pubkey = self.base.signer.get_public_key();
        let kinds = vec![KIND_TOOLS_LIST, KIND_RESOURCES_LIST, KIND_RESOURCE_TEMPLATES_LIST, KIND_PROMPTS_LIST];
        let filter = Filter::new().authors([own_pubkey.clone()]).kinds(kinds);

        let found = Arc::new(Mutex::new(HashSet::new()));
        let found2 = found.clone();
        let (eose_tx, eose_rx) = oneshot::channel();
        let eose_tx = Arc::new(Mutex::new(Some(eose_tx)));
        let sub = self
            .base
            .relay_pool
            .subscribe(
                vec![filter],
                Arc::new(move |ev: Event| {
                    found2.lock().unwrap().insert(ev.id);
                }),
                Some(Arc::new(move || {
                    if let Some(tx) = eose_tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                })),
            )
            .await;
        let _ = tokio::time::timeout(Duration::from_secs(5), eose_rx).await;
        sub.unsubscribe().await;

        let ids: HashSet<String> = found.lock().unwrap().clone();
        if !ids.is_empty() {
            let mut tags: Vec<Tag> = ids.iter().map(|id| tag("e", id)).collect();
            tags.push(tag("reason", reason));
            let deletion = crate::event::UnsignedEvent {
                pubkey: own_pubkey,
                created_at: chrono::Utc::now().timestamp(),
                kind: KIND_DELETION,
                tags,
                content: String::new(),
            };
            let signed = self.base.signer.sign_event(deletion).await?;
            self.base.publish_event(signed, tokio_util::sync::CancellationToken::new()).await?;
        }
        Ok(ids)
    }
}

#[async_trait::async_trait]
impl Transport for ServerTransport {
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
        if self.config.is_public_server {
            let this = self.clone();
            tokio::spawn(async move { this.run_announcement_handshake().await });
        }
        Ok(())
    }

    async fn send(self: Arc<Self>, message: JsonRpcMessage) -> BridgeResult<()> {
        match &message {
            JsonRpcMessage::Response(resp) if resp.id == Value::String(ANNOUNCEMENT_ID.to_string()) => {
                if let Some(tx) = self.announcement_waiter.lock().unwrap().take() {
                    let _ = tx.send(message);
                }
                Ok(())
            }
            JsonRpcMessage::Response(resp) => {
                let event_id = match &resp.id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let route = {
                    let mut routes = self.routes.lock().unwrap();
                    let Some(route) = routes.peek(&event_id).cloned() else {
                        warn!(event_id, "response for unknown route");
                        return Ok(());
                    };
                    if route.published {
                        return Ok(()); // concurrent double-send: at most once
                    }
                    routes.insert(
                        event_id.clone(),
                        RouteEntry {
                            published: true,
                            ..route.clone()
                        },
                    );
                    route
                };

                let mut restored = message;
                if let JsonRpcMessage::Response(r) = &mut restored {
                    r.id = route.original_request_id.clone();
                }
                let tags = vec![tag("p", &route.client_pubkey), tag("e", &event_id)];
                let is_encrypted = self
                    .sessions
                    .lock()
                    .unwrap()
                    .peek(&route.client_pubkey)
                    .map(|s| s.is_encrypted)
                    .unwrap_or(false);

                let result = self
                    .base
                    .send_mcp_message(
                        &restored,
                        &route.client_pubkey,
                        KIND_APPLICATION_MESSAGE,
                        self.gift_wrap_ephemeral(),
                        tags,
                        is_encrypted,
                        |_| {},
                    )
                    .await;
                self.routes.lock().unwrap().remove(&event_id);
                if let Some(tok) = &route.progress_token {
                    self.progress_index.lock().unwrap().remove(tok);
                }
                result
            }
            JsonRpcMessage::Notification(n) if n.method == "notifications/progress" => {
                let token = message.progress_token();
                let Some(token) = token else {
                    return Ok(());
                };
                let Some(event_id) = self.progress_index.lock().unwrap().peek(&token).cloned() else {
                    return Ok(());
                };
                let Some(route) = self.routes.lock().unwrap().peek(&event_id).cloned() else {
                    return Ok(());
                };
                let tags = vec![tag("p", &route.client_pubkey), tag("e", &event_id)];
                self.base
                    .send_mcp_message(
                        &message,
                        &route.client_pubkey,
                        KIND_APPLICATION_MESSAGE,
                        self.gift_wrap_ephemeral(),
                        tags,
                        false,
                        |_| {},
                    )
                    .await
            }
            JsonRpcMessage::Notification(_) => {
                let targets: Vec<String> = self
                    .sessions
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, s)| s.is_initialized)
                    .map(|(pk, _)| pk.clone())
                    .collect();
                for client_pubkey in targets {
                    let this = self.clone();
                    let message = message.clone();
                    tokio::spawn(async move {
                        let _ = this.send_notification(&client_pubkey, message, None).await;
                    });
                }
                Ok(())
            }
            JsonRpcMessage::Request(_) => Err(BridgeError::InvalidLifecycle("server transport cannot send a request")),
        }
    }

    async fn close(self: Arc<Self>) -> BridgeResult<()> {
        self.base.unsubscribe_all().await;
        self.base.disconnect().await?;
        self.sessions.lock().unwrap().drain_all();
        self.routes.lock().unwrap().drain_all();
        if let Some(cb) = self.on_close.lock().unwrap().clone() {
            cb();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_APPLICATION_MESSAGE;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::PrivateKeySigner;
    use std::sync::Mutex as StdMutex;

    fn make_server(is_public: bool) -> (Arc<ServerTransport>, Arc<FakeRelayPool>) {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        let authz = Arc::new(AuthorizationPolicy::new(None, vec![], is_public));
        let config = ServerTransportConfig {
            is_public_server: is_public,
            ..Default::default()
        };
        (ServerTransport::new(signer, pool.clone(), authz, config), pool)
    }

    fn client_request_event(client: &PrivateKeySigner, server_pubkey: &str, method: &str) -> Event {
        Event {
            id: format!("req-{method}"),
            pubkey: client.get_public_key(),
            created_at: 0,
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", server_pubkey)],
            content: serde_json::json!({"jsonrpc":"2.0","id":1,"method":method}).to_string(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn inbound_request_is_routed_and_delivered_with_swapped_id() {
        let (server, _pool) = make_server(false);
        let own_pubkey = server.base.signer.get_public_key();
        let client = PrivateKeySigner::generate();

        let received = Arc::new(StdMutex::new(None));
        let received2 = received.clone();
        server.set_on_message(Arc::new(move |m| *received2.lock().unwrap() = Some(m)));

        let event = client_request_event(&client, &own_pubkey, "tools/list");
        let event_id = event.id.clone();
        server.handle_inbound(event);

        let got = received.lock().unwrap().take().expect("delivered");
        if let JsonRpcMessage::Request(r) = got {
            assert_eq!(r.id, Value::String(event_id.clone()));
        } else {
            panic!("expected request");
        }
        assert_eq!(server.routes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn response_send_restores_original_id_and_clears_route() {
        let (server, pool) = make_server(false);
        pool.clone().connect().await;
        let own_pubkey = server.base.signer.get_public_key();
        let client = PrivateKeySigner::generate();

        let event = client_request_event(&client, &own_pubkey, "tools/list");
        let event_id = event.id.clone();
        server.clone().handle_inbound(event);

        let response = JsonRpcMessage::Response(crate::jsonrpc::JsonRpcResponse {
            jsonrpc: crate::jsonrpc::JsonRpcVersion,
            id: Value::String(event_id.clone()),
            payload: crate::jsonrpc::JsonRpcResponsePayload::Result { result: Value::Null },
        });
        server.clone().send(response).await.unwrap();

        assert!(!server.routes.lock().unwrap().contains(&event_id));
        let published = pool.published_events();
        assert_eq!(published.len(), 1);
    }

    #[tokio::test]
    async fn public_server_denial_publishes_unauthorized_error() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        pool.clone().connect().await;
        let mut allowed = HashSet::new();
        allowed.insert("friend".to_string());
        let authz = Arc::new(AuthorizationPolicy::new(Some(allowed), vec![], true));
        let config = ServerTransportConfig {
            is_public_server: true,
            ..Default::default()
        };
        let server = ServerTransport::new(signer, pool.clone(), authz, config);
        let own_pubkey = server.base.signer.get_public_key();
        let client = PrivateKeySigner::generate();

        let event = client_request_event(&client, &own_pubkey, "tools/call");
        server.clone().handle_inbound(event);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(pool.published_events().len(), 1);
    }
}
