//! Process-level configuration (§6, §10.3): a `BridgeConfig` loaded the way
//! the host daemon's own config layer is — CLI/env overrides a TOML file
//! which overrides built-in defaults — covering every knob §6 names as
//! process-level configuration. Trait-object fields (`signer`, `relayHandler`,
//! `processors`, `handlers`, `resolvePrice`) are not data and are wired up by
//! the binary's bootstrap code from the plain values this struct carries.

use crate::event::codec::{EncryptionMode, GiftWrapMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_PING_FREQUENCY_MS: u64 = 10_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30 * 60_000;
const DEFAULT_SYNTHETIC_PROGRESS_INTERVAL_MS: u64 = 5_000;
const DEFAULT_NWC_TTL_SECONDS: u64 = 300;
const DEFAULT_NWC_POLL_INTERVAL_MS: u64 = 1_500;
const DEFAULT_NWC_RESPONSE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_NWC_MAX_IN_FLIGHT_VERIFICATIONS: usize = 5_000;
const DEFAULT_NWC_INVOICE_HASH_CACHE_SIZE: usize = 10_000;
const DEFAULT_LOG: &str = "info";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// A `(method, name?)` pair, mirrored from `authz::Exclusion` so both
/// `excludedCapabilities` and `pricedCapabilities` can be expressed in TOML
/// without depending on the authz module's internal types.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CapabilityRef {
    pub method: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PricedCapabilityToml {
    pub method: String,
    pub name: Option<String>,
    pub amount: u64,
    pub description: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlRelayPool {
    urls: Option<Vec<String>>,
    ping_frequency_ms: Option<u64>,
    ping_timeout_ms: Option<u64>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlBaseTransport {
    encryption_mode: Option<String>,
    gift_wrap_mode: Option<String>,
    log_level: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlServerTransport {
    is_public_server: Option<bool>,
    allowed_public_keys: Option<Vec<String>>,
    excluded_capabilities: Option<Vec<CapabilityRef>>,
    cleanup_interval_ms: Option<u64>,
    session_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlClientTransport {
    server_pubkey: Option<String>,
    is_stateless: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlServerPayments {
    priced_capabilities: Option<Vec<PricedCapabilityToml>>,
}

#[derive(Deserialize, Default)]
struct TomlClientPayments {
    synthetic_progress_interval_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlNwc {
    connection_string: Option<String>,
    ttl_seconds: Option<u64>,
    invoice_expiry_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
    max_in_flight_verifications: Option<usize>,
    invoice_hash_cache_size: Option<usize>,
    enable_notification_verification: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlZap {
    lightning_address: Option<String>,
    zap_relays: Option<Vec<String>>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    log: Option<String>,
    relay_pool: Option<TomlRelayPool>,
    base_transport: Option<TomlBaseTransport>,
    server_transport: Option<TomlServerTransport>,
    client_transport: Option<TomlClientTransport>,
    server_payments: Option<TomlServerPayments>,
    client_payments: Option<TomlClientPayments>,
    nwc: Option<TomlNwc>,
    zap: Option<TomlZap>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            tracing::error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn parse_encryption_mode(s: &str) -> EncryptionMode {
    match s {
        "disabled" => EncryptionMode::Disabled,
        "required" => EncryptionMode::Required,
        _ => EncryptionMode::Optional,
    }
}

fn parse_gift_wrap_mode(s: &str) -> GiftWrapMode {
    match s {
        "persistent" => GiftWrapMode::Persistent,
        "ephemeral" => GiftWrapMode::Ephemeral,
        _ => GiftWrapMode::Auto,
    }
}

// ─── BridgeConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RelayPoolSection {
    pub urls: Vec<String>,
    pub ping_frequency_ms: u64,
    pub ping_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BaseTransportSection {
    pub encryption_mode: EncryptionMode,
    pub gift_wrap_mode: GiftWrapMode,
    pub log_level: String,
}

#[derive(Debug, Clone, Default)]
pub struct ServerTransportSection {
    pub is_public_server: bool,
    pub allowed_public_keys: Option<Vec<String>>,
    pub excluded_capabilities: Vec<CapabilityRef>,
    pub cleanup_interval_ms: u64,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTransportSection {
    pub server_pubkey: Option<String>,
    pub is_stateless: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ServerPaymentsSection {
    pub priced_capabilities: Vec<PricedCapabilityToml>,
}

#[derive(Debug, Clone)]
pub struct ClientPaymentsSection {
    pub synthetic_progress_interval_ms: u64,
}

/// NIP-47 (NWC) processor knobs (§4.W, §6).
#[derive(Debug, Clone, Default)]
pub struct NwcSection {
    pub connection_string: Option<String>,
    pub ttl_seconds: u64,
    pub invoice_expiry_seconds: u64,
    pub poll_interval_ms: u64,
    pub response_timeout_ms: u64,
    pub max_in_flight_verifications: usize,
    pub invoice_hash_cache_size: usize,
    pub enable_notification_verification: bool,
}

/// NIP-57 zap processor knobs; not named directly in §6's NWC block but
/// carried the same way since it is the alternative bolt11 rail (§4.W).
#[derive(Debug, Clone, Default)]
pub struct ZapSection {
    pub lightning_address: Option<String>,
    pub zap_relays: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub data_dir: PathBuf,
    pub log: String,
    pub relay_pool: RelayPoolSection,
    pub base_transport: BaseTransportSection,
    pub server_transport: ServerTransportSection,
    pub client_transport: ClientTransportSection,
    pub server_payments: ServerPaymentsSection,
    pub client_payments: ClientPaymentsSection,
    pub nwc: NwcSection,
    pub zap: ZapSection,
}

impl BridgeConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)`
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        data_dir: Option<PathBuf>,
        log: Option<String>,
        relay_urls: Option<Vec<String>>,
        server_pubkey: Option<String>,
        nwc_connection_string: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log
            .or_else(|| toml.log.clone())
            .unwrap_or_else(|| DEFAULT_LOG.to_string());

        let relay_pool_toml = toml.relay_pool.unwrap_or_default();
        let relay_pool = RelayPoolSection {
            urls: relay_urls.or(relay_pool_toml.urls).unwrap_or_default(),
            ping_frequency_ms: relay_pool_toml.ping_frequency_ms.unwrap_or(DEFAULT_PING_FREQUENCY_MS),
            ping_timeout_ms: relay_pool_toml.ping_timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS),
            reconnect_base_delay_ms: relay_pool_toml
                .reconnect_base_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
            reconnect_max_delay_ms: relay_pool_toml
                .reconnect_max_delay_ms
                .unwrap_or(DEFAULT_RECONNECT_MAX_DELAY_MS),
        };

        let base_toml = toml.base_transport.unwrap_or_default();
        let base_transport = BaseTransportSection {
            encryption_mode: base_toml
                .encryption_mode
                .as_deref()
                .map(parse_encryption_mode)
                .unwrap_or_default(),
            gift_wrap_mode: base_toml
                .gift_wrap_mode
                .as_deref()
                .map(parse_gift_wrap_mode)
                .unwrap_or_default(),
            log_level: base_toml.log_level.unwrap_or_else(|| log.clone()),
        };

        let server_toml = toml.server_transport.unwrap_or_default();
        let server_transport = ServerTransportSection {
            is_public_server: server_toml.is_public_server.unwrap_or(false),
            allowed_public_keys: server_toml.allowed_public_keys,
            excluded_capabilities: server_toml.excluded_capabilities.unwrap_or_default(),
            cleanup_interval_ms: server_toml.cleanup_interval_ms.unwrap_or(DEFAULT_CLEANUP_INTERVAL_MS),
            session_timeout_ms: server_toml.session_timeout_ms.unwrap_or(DEFAULT_SESSION_TIMEOUT_MS),
        };

        let client_toml = toml.client_transport.unwrap_or_default();
        let client_transport = ClientTransportSection {
            server_pubkey: server_pubkey.or(client_toml.server_pubkey),
            is_stateless: client_toml.is_stateless.unwrap_or(false),
        };

        let server_payments_toml = toml.server_payments.unwrap_or_default();
        let server_payments = ServerPaymentsSection {
            priced_capabilities: server_payments_toml.priced_capabilities.unwrap_or_default(),
        };

        let client_payments_toml = toml.client_payments.unwrap_or_default();
        let client_payments = ClientPaymentsSection {
            synthetic_progress_interval_ms: client_payments_toml
                .synthetic_progress_interval_ms
                .unwrap_or(DEFAULT_SYNTHETIC_PROGRESS_INTERVAL_MS),
        };

        let nwc_toml = toml.nwc.unwrap_or_default();
        let ttl_seconds = nwc_toml.ttl_seconds.unwrap_or(DEFAULT_NWC_TTL_SECONDS);
        let nwc = NwcSection {
            connection_string: nwc_connection_string.or(nwc_toml.connection_string),
            ttl_seconds,
            invoice_expiry_seconds: nwc_toml.invoice_expiry_seconds.unwrap_or(ttl_seconds),
            poll_interval_ms: nwc_toml.poll_interval_ms.unwrap_or(DEFAULT_NWC_POLL_INTERVAL_MS),
            response_timeout_ms: nwc_toml.response_timeout_ms.unwrap_or(DEFAULT_NWC_RESPONSE_TIMEOUT_MS),
            max_in_flight_verifications: nwc_toml
                .max_in_flight_verifications
                .unwrap_or(DEFAULT_NWC_MAX_IN_FLIGHT_VERIFICATIONS),
            invoice_hash_cache_size: nwc_toml
                .invoice_hash_cache_size
                .unwrap_or(DEFAULT_NWC_INVOICE_HASH_CACHE_SIZE),
            enable_notification_verification: nwc_toml.enable_notification_verification.unwrap_or(false),
        };

        let zap_toml = toml.zap.unwrap_or_default();
        let zap = ZapSection {
            lightning_address: zap_toml.lightning_address,
            zap_relays: zap_toml.zap_relays.unwrap_or_default(),
        };

        Self {
            data_dir,
            log,
            relay_pool,
            base_transport,
            server_transport,
            client_transport,
            server_payments,
            client_payments,
            nwc,
            zap,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("mcp-relay-bridge");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("mcp-relay-bridge");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("mcp-relay-bridge");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("mcp-relay-bridge");
        }
    }
    PathBuf::from(".mcp-relay-bridge")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_toml_and_no_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BridgeConfig::new(Some(dir.path().to_path_buf()), None, None, None, None);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.relay_pool.ping_frequency_ms, DEFAULT_PING_FREQUENCY_MS);
        assert_eq!(cfg.nwc.ttl_seconds, DEFAULT_NWC_TTL_SECONDS);
        assert_eq!(cfg.nwc.invoice_expiry_seconds, DEFAULT_NWC_TTL_SECONDS);
        assert!(!cfg.server_transport.is_public_server);
    }

    #[test]
    fn cli_overrides_beat_toml_which_beats_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            log = "debug"
            [nwc]
            ttl_seconds = 120
            connection_string = "nostr+walletconnect://toml"
            "#,
        )
        .unwrap();

        let cfg = BridgeConfig::new(
            Some(dir.path().to_path_buf()),
            None,
            None,
            None,
            Some("nostr+walletconnect://cli".to_string()),
        );
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.nwc.ttl_seconds, 120);
        assert_eq!(cfg.nwc.connection_string.as_deref(), Some("nostr+walletconnect://cli"));
    }

    #[test]
    fn invoice_expiry_defaults_to_ttl_seconds_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
            [nwc]
            ttl_seconds = 777
            "#,
        )
        .unwrap();
        let cfg = BridgeConfig::new(Some(dir.path().to_path_buf()), None, None, None, None);
        assert_eq!(cfg.nwc.invoice_expiry_seconds, 777);
    }
}
