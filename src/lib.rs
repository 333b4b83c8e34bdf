pub mod authz;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod jsonrpc;
pub mod lru_store;
pub mod observability;
pub mod payments;
pub mod relay;
pub mod signer;
pub mod transport;
pub mod wallet;

use crate::authz::AuthorizationPolicy;
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::relay::ws::WsRelayPool;
use crate::relay::{RelayPool, RelayPoolConfig};
use crate::signer::{PrivateKeySigner, Signer};
use crate::transport::client::{ClientTransport, ClientTransportConfig};
use crate::transport::server::{ServerTransport, ServerTransportConfig};
use std::sync::Arc;

/// Everything a running bridge process needs in hand once it has parsed its
/// config and generated/loaded its identity key, independent of which
/// transport roles (client, server, or both via a gateway) it ends up
/// playing. Analogous to the host daemon's own top-level application context,
/// scoped down to this crate's components.
pub struct BridgeContext {
    pub config: Arc<BridgeConfig>,
    pub signer: Arc<dyn Signer>,
    pub relay_pool: Arc<dyn RelayPool>,
}

impl BridgeContext {
    /// Generate a fresh identity key and connect the relay pool named in
    /// `config.relay_pool.urls`. Does not start any transport — callers pick
    /// client, server, or both (via `gateway::Gateway`) on top of this.
    pub fn bootstrap(config: BridgeConfig) -> Self {
        let signer: Arc<dyn Signer> = Arc::new(PrivateKeySigner::generate());
        let relay_config = RelayPoolConfig {
            urls: config.relay_pool.urls.clone(),
            ping_frequency: std::time::Duration::from_millis(config.relay_pool.ping_frequency_ms),
            ping_timeout: std::time::Duration::from_millis(config.relay_pool.ping_timeout_ms),
            reconnect_base_delay_ms: config.relay_pool.reconnect_base_delay_ms,
            reconnect_max_delay_ms: config.relay_pool.reconnect_max_delay_ms,
            ..Default::default()
        };
        let relay_pool = WsRelayPool::new(relay_config);
        Self {
            config: Arc::new(config),
            signer,
            relay_pool,
        }
    }

    /// Build the server side (§4.V): a `ServerTransport` speaking for this
    /// process's identity, gated by the allow-list/exclusions §6 names.
    pub fn build_server_transport(&self, authz: Arc<AuthorizationPolicy>) -> Arc<ServerTransport> {
        let cfg = ServerTransportConfig {
            server_info: None,
            is_public_server: self.config.server_transport.is_public_server,
            encryption_mode: self.config.base_transport.encryption_mode,
            gift_wrap_mode: self.config.base_transport.gift_wrap_mode,
            profile_tags: vec![],
            announcement_timeout: std::time::Duration::from_secs(10),
        };
        ServerTransport::new(self.signer.clone(), self.relay_pool.clone(), authz, cfg)
    }

    /// Build the client side (§4.C) bound to a single server pubkey.
    pub fn build_client_transport(&self) -> BridgeResult<Arc<ClientTransport>> {
        let server_pubkey = self
            .config
            .client_transport
            .server_pubkey
            .clone()
            .ok_or_else(|| error::BridgeError::Signer("client transport requires a configured server_pubkey".into()))?;
        let cfg = ClientTransportConfig {
            server_pubkey,
            is_stateless: self.config.client_transport.is_stateless,
            strict_ephemeral: false,
            encryption_mode: self.config.base_transport.encryption_mode,
            gift_wrap_mode: self.config.base_transport.gift_wrap_mode,
        };
        Ok(ClientTransport::new(self.signer.clone(), self.relay_pool.clone(), cfg))
    }
}
