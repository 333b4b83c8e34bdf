//! Transport capability (§4.B/C/V): the MCP-facing port every layer above
//! the relay pool talks to. `BaseTransport` shares connect/subscribe/publish
//! plumbing; `ClientTransport` and `ServerTransport` each add their own
//! inbound routing on top.

pub mod base;
pub mod client;
pub mod server;

use crate::error::BridgeResult;
use crate::jsonrpc::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// Context carried alongside an inbound message so callers that need more
/// than the bare JSON-RPC value (the gateway, payments middleware) can find
/// out who it came from and how it correlates (§4.C `onmessageWithContext`).
#[derive(Debug, Clone)]
pub struct OriginalRequestContext {
    pub event_id: String,
    pub correlated_event_id: Option<String>,
    pub client_pubkey: Option<String>,
}

pub type OnMessage = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;
pub type OnMessageWithContext = Arc<dyn Fn(JsonRpcMessage, OriginalRequestContext) + Send + Sync>;
pub type OnError = Arc<dyn Fn(crate::error::BridgeError) + Send + Sync>;
pub type OnClose = Arc<dyn Fn() + Send + Sync>;
/// Fired by `ServerTransport` when its bounded session store evicts a
/// client's session (§4.V) — the gateway's per-client factory mode uses this
/// to tear down the matching backend transport.
pub type OnClientSessionEvicted = Arc<dyn Fn(String) + Send + Sync>;
/// Refuses eviction of a session about to be dropped by the LRU session
/// store (e.g. it has requests still in flight); returning `false` puts the
/// session straight back (§4.V).
pub type ShouldEvictSession = Arc<dyn Fn(&crate::transport::server::ServerSession) -> bool + Send + Sync>;

/// Pending outbound request state kept by the client correlation store and
/// the server route store (§4.C, §4.V). Not every field is relevant to both
/// stores; unused ones are left `None`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub original_request_id: serde_json::Value,
    pub is_initialize: bool,
    pub progress_token: Option<String>,
    pub client_pubkey: Option<String>,
    /// The request's JSON-RPC method, kept so the payments wrapper can
    /// describe a declined payment without re-parsing the original request
    /// (§4.Q decline error `data.method`).
    pub method: Option<String>,
    /// `tool:<name>` | `prompt:<name>` | `resource:<uri>`, precomputed the
    /// same way §4.A exclusions identify a capability.
    pub capability: Option<String>,
}

/// The MCP-facing contract both client and server transports implement
/// (§4.C, §4.V). The gateway and payments layers depend only on this trait,
/// never on the concrete transport type. `Arc<Self>` receivers match the
/// relay pool's: `start` hands an owned clone of `self` into the inbound
/// subscription callback.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn start(self: Arc<Self>) -> BridgeResult<()>;
    async fn send(self: Arc<Self>, message: JsonRpcMessage) -> BridgeResult<()>;
    async fn close(self: Arc<Self>) -> BridgeResult<()>;
}
