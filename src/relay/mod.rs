//! Relay Pool (§4.R): a single logical pub/sub endpoint over a configured
//! set of relay URLs, with retrying publish, filter-replaying subscribe, and
//! liveness-triggered rebuilds.
//!
//! Grounded on `daemon/src/relay/mod.rs`'s `relay_loop`/`sleep_backoff`
//! reconnect machinery, generalized from a single control-plane socket to a
//! pool of N relay sockets with single-flight rebuild.

pub mod backoff;
pub mod fake;
pub mod ws;

use crate::error::BridgeResult;
use crate::event::Event;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A Nostr REQ filter (§6). Only the fields the core relies on are modeled;
/// anything else is an external collaborator per §1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    #[serde(rename = "#p", skip_serializing_if = "Vec::is_empty")]
    pub p_tags: Vec<String>,
    #[serde(rename = "#e", skip_serializing_if = "Vec::is_empty")]
    pub e_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }
    pub fn p_tag(mut self, pubkey: impl Into<String>) -> Self {
        self.p_tags.push(pubkey.into());
        self
    }
    pub fn e_tag(mut self, event_id: impl Into<String>) -> Self {
        self.e_tags.push(event_id.into());
        self
    }
    pub fn authors(mut self, authors: impl IntoIterator<Item = String>) -> Self {
        self.authors = authors.into_iter().collect();
        self
    }
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

pub type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;
pub type OnEose = Arc<dyn Fn() + Send + Sync>;

/// Returned by `subscribe`; calling `unsubscribe` is idempotent (§4.R).
pub struct Subscription {
    pub id: String,
    pool: Arc<dyn RelayPool>,
}

impl Subscription {
    pub async fn unsubscribe(&self) {
        self.pool.unsubscribe(&self.id).await;
    }
}

#[derive(Debug, Clone)]
pub struct RelayPoolConfig {
    pub urls: Vec<String>,
    pub ping_frequency: std::time::Duration,
    pub ping_timeout: std::time::Duration,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub publish_retry_base_delay_ms: u64,
    pub publish_retry_cap_delay_ms: u64,
}

impl Default for RelayPoolConfig {
    fn default() -> Self {
        Self {
            urls: vec![],
            ping_frequency: std::time::Duration::from_secs(10),
            ping_timeout: std::time::Duration::from_secs(5),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            publish_retry_base_delay_ms: 250,
            publish_retry_cap_delay_ms: 5_000,
        }
    }
}

/// The Relay Pool port. A production implementation (`ws::WsRelayPool`)
/// talks to real relays; tests use `fake::FakeRelayPool` so higher layers
/// (transports, payments) can be tested without a network.
#[async_trait]
pub trait RelayPool: Send + Sync + 'static {
    async fn connect(self: Arc<Self>);
    async fn disconnect(self: Arc<Self>);

    /// Publish `event`, retrying with bounded backoff until at least one
    /// relay accepts it or `cancel` fires (§4.R).
    async fn publish(self: Arc<Self>, event: Event, cancel: CancellationToken) -> BridgeResult<()>;

    async fn subscribe(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        on_event: OnEvent,
        on_eose: Option<OnEose>,
    ) -> Subscription;

    async fn unsubscribe(&self, sub_id: &str);

    fn relay_urls(&self) -> Vec<String>;
}
