//! Binary entry point: parses config (§10.3), wires a `BridgeContext` into
//! either a server-side gateway (`serve`), a one-shot client call (`call`),
//! or a diagnostic pass (`doctor`).

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mcp_relay_bridge::authz::{AuthorizationPolicy, Exclusion};
use mcp_relay_bridge::config::BridgeConfig;
use mcp_relay_bridge::gateway::Gateway;
use mcp_relay_bridge::jsonrpc::{JsonRpcMessage, JsonRpcRequest, JsonRpcVersion};
use mcp_relay_bridge::payments::client::{ClientPaymentsWrapper, DEFAULT_SYNTHETIC_PROGRESS_INTERVAL};
use mcp_relay_bridge::payments::server::ServerPaymentsMiddleware;
use mcp_relay_bridge::payments::{PaymentHandler, PaymentProcessor, PricedCapability};
use mcp_relay_bridge::relay::RelayPool;
use mcp_relay_bridge::signer::PrivateKeySigner;
use mcp_relay_bridge::transport::Transport;
use mcp_relay_bridge::wallet::nwc_processor::{NwcPaymentHandler, NwcPaymentProcessor};
use mcp_relay_bridge::wallet::zap_processor::ZapPaymentProcessor;
use mcp_relay_bridge::wallet::{Nip47Client, NwcConnection};
use mcp_relay_bridge::BridgeContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

const DEFAULT_NWC_POLL_FLOOR_MS: u64 = 500;

#[derive(Parser)]
#[command(
    name = "mcp-relay-bridged",
    about = "MCP-over-Nostr transport, correlation, and payment-gating bridge",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory holding config.toml and any persisted state.
    #[arg(long, env = "MCP_BRIDGE_DATA_DIR", global = true)]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "MCP_BRIDGE_LOG", global = true)]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "MCP_BRIDGE_LOG_FILE", global = true)]
    log_file: Option<std::path::PathBuf>,

    /// Relay URLs to connect the pool to (repeatable).
    #[arg(long = "relay", env = "MCP_BRIDGE_RELAY_URLS", value_delimiter = ',', global = true)]
    relay: Option<Vec<String>>,

    /// Upstream/downstream server pubkey this process speaks to as a client.
    #[arg(long, env = "MCP_BRIDGE_SERVER_PUBKEY", global = true)]
    server_pubkey: Option<String>,

    /// `nostr+walletconnect://...` connection string for the NWC wallet.
    #[arg(long, env = "MCP_BRIDGE_NWC", global = true)]
    nwc: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run as an MCP server over Nostr (§4.V/G/P), proxying to the
    /// upstream server named by `--server-pubkey` and gating any priced
    /// capabilities from config.toml behind payment (§4.P).
    ///
    /// Examples:
    ///   mcp-relay-bridged serve
    Serve,
    /// Act as an MCP client (§4.C/Q): send one JSON-RPC request to
    /// `--server-pubkey` and print the response, paying automatically if
    /// the server demands it and `--nwc` is configured.
    ///
    /// Examples:
    ///   mcp-relay-bridged call initialize '{}'
    ///   mcp-relay-bridged call tools/call '{"name":"search","arguments":{}}'
    Call {
        method: String,
        /// JSON params (default: `{}`)
        params: Option<String>,
    },
    /// Run local diagnostic checks: config parses, at least one relay URL
    /// is configured, and (if set) the NWC connection string parses.
    ///
    /// Exit code 0 if all checks pass, 1 if any check fails.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let config = BridgeConfig::new(
        args.data_dir.clone(),
        args.log.clone(),
        args.relay.clone(),
        args.server_pubkey.clone(),
        args.nwc.clone(),
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Doctor => run_doctor(&config),
        Command::Serve => run_serve(config).await,
        Command::Call { method, params } => {
            let params: serde_json::Value = match params {
                Some(p) => serde_json::from_str(&p).context("params must be valid JSON")?,
                None => serde_json::json!({}),
            };
            run_call(config, method, params).await
        }
    }
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(path) = log_file else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("bridge.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            dir.display()
        );
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}

fn run_doctor(config: &BridgeConfig) -> Result<()> {
    let mut failed = false;

    if config.relay_pool.urls.is_empty() {
        println!("FAIL  no relay URLs configured (--relay or relay_pool.urls in config.toml)");
        failed = true;
    } else {
        println!("OK    {} relay URL(s) configured", config.relay_pool.urls.len());
    }

    match &config.nwc.connection_string {
        Some(uri) => match NwcConnection::parse(uri) {
            Ok(conn) => println!("OK    NWC connection string parses (wallet {})", &conn.wallet_pubkey[..8]),
            Err(e) => {
                println!("FAIL  NWC connection string does not parse: {e}");
                failed = true;
            }
        },
        None => println!("SKIP  no NWC connection string configured"),
    }

    match &config.client_transport.server_pubkey {
        Some(pk) => println!("OK    server pubkey configured ({})", &pk[..8.min(pk.len())]),
        None => println!("SKIP  no server pubkey configured (required for `call`/Nostr-to-Nostr `serve`)"),
    }

    println!("OK    data dir: {}", config.data_dir.display());

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Build the NIP-47/zap payment processors named by config, for either the
/// server-side middleware (`PaymentProcessor`) or client-side wrapper
/// (`PaymentHandler`). NIP-47 requires every `wallet_request` to be signed
/// and NIP-04-encrypted with the connection secret the wallet authorized —
/// not this process's own Nostr identity — so the client gets its own
/// signer derived from `conn.secret_hex`.
fn build_wallet_client(ctx: &BridgeContext, config: &BridgeConfig) -> Result<Option<Arc<Nip47Client>>> {
    let Some(uri) = &config.nwc.connection_string else {
        return Ok(None);
    };
    let conn = NwcConnection::parse(uri).context("failed to parse NWC connection string")?;
    let wallet_signer = Arc::new(
        PrivateKeySigner::from_hex(&conn.secret_hex).context("NWC connection secret is not a valid private key")?,
    );
    Ok(Some(Nip47Client::new(wallet_signer, ctx.relay_pool.clone(), conn)))
}

fn build_server_processors(
    nwc_client: Option<Arc<Nip47Client>>,
    ctx: &BridgeContext,
    config: &BridgeConfig,
) -> Vec<Arc<dyn PaymentProcessor>> {
    let mut processors: Vec<Arc<dyn PaymentProcessor>> = Vec::new();
    if let Some(client) = nwc_client {
        processors.push(NwcPaymentProcessor::new(client, DEFAULT_NWC_POLL_FLOOR_MS));
    }
    if let Some(address) = &config.zap.lightning_address {
        processors.push(ZapPaymentProcessor::new(
            ctx.signer.clone(),
            ctx.relay_pool.clone(),
            address.clone(),
            config.zap.zap_relays.clone(),
        ));
    }
    processors
}

fn priced_capabilities(config: &BridgeConfig) -> Vec<PricedCapability> {
    config
        .server_payments
        .priced_capabilities
        .iter()
        .map(|p| PricedCapability {
            method: p.method.clone(),
            name: p.name.clone(),
            amount: p.amount,
            description: p.description.clone(),
        })
        .collect()
}

fn exclusions(config: &BridgeConfig) -> Vec<Exclusion> {
    config
        .server_transport
        .excluded_capabilities
        .iter()
        .map(|e| Exclusion::new(e.method.clone(), e.name.clone()))
        .collect()
}

/// `serve`: this process's server identity gates access to, and meters
/// payment for, an upstream MCP-over-Nostr server reachable at
/// `--server-pubkey` (§4.G Nostr-to-Nostr gateway mode).
async fn run_serve(config: BridgeConfig) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "mcp-relay-bridged starting");
    let ctx = BridgeContext::bootstrap(config);
    ctx.relay_pool.clone().connect().await;

    let allowed_pubkeys = ctx
        .config
        .server_transport
        .allowed_public_keys
        .clone()
        .map(|v| v.into_iter().collect());
    let authz = Arc::new(AuthorizationPolicy::new(
        allowed_pubkeys,
        exclusions(&ctx.config),
        ctx.config.server_transport.is_public_server,
    ));
    let server = ctx.build_server_transport(authz);

    let nwc_client = build_wallet_client(&ctx, &ctx.config)?;
    let processors = build_server_processors(nwc_client, &ctx, &ctx.config);
    let priced = priced_capabilities(&ctx.config);

    let upstream = ctx.build_client_transport().context(
        "`serve` requires a configured server_pubkey naming the upstream MCP-over-Nostr server to proxy to",
    )?;
    upstream.clone().start().await?;

    let gateway = Gateway::single_backend(server.clone(), upstream.clone());

    // Backend (upstream) responses are routed back through the server
    // transport by the outer event id the server stamped onto the
    // forwarded request — restored verbatim by the client transport's own
    // correlation store (§4.C, §4.V).
    {
        let server = server.clone();
        upstream.set_on_message(Arc::new(move |msg: JsonRpcMessage| {
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(e) = server.send(msg).await {
                    warn!(error = %e, "failed to deliver upstream response to client");
                }
            });
        }));
    }

    if processors.is_empty() && priced.is_empty() {
        gateway.start().await?;
    } else {
        let middleware = ServerPaymentsMiddleware::new(server.clone(), processors, priced, None);
        let downstream = gateway.forward_callback();
        gateway.start_with_on_message(middleware.wrap(downstream)).await?;
    }

    info!("serving — press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    gateway.stop().await?;
    ctx.relay_pool.clone().disconnect().await;
    Ok(())
}

/// `call`: one-shot MCP client request against `--server-pubkey`, paying
/// automatically via `--nwc` if the server responds with
/// `notifications/payment_required` (§4.Q).
async fn run_call(config: BridgeConfig, method: String, params: serde_json::Value) -> Result<()> {
    let ctx = BridgeContext::bootstrap(config);
    ctx.relay_pool.clone().connect().await;

    let inner = ctx
        .build_client_transport()
        .context("`call` requires --server-pubkey naming the server to talk to")?;

    let nwc_client = build_wallet_client(&ctx, &ctx.config)?;
    let handlers: Vec<Arc<dyn PaymentHandler>> = match nwc_client {
        Some(client) => vec![NwcPaymentHandler::new(client)],
        None => vec![],
    };
    let interval = if ctx.config.client_payments.synthetic_progress_interval_ms > 0 {
        Duration::from_millis(ctx.config.client_payments.synthetic_progress_interval_ms)
    } else {
        DEFAULT_SYNTHETIC_PROGRESS_INTERVAL
    };
    let wrapper = ClientPaymentsWrapper::wrap(inner.clone(), handlers, None, interval);

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    wrapper.set_on_message(Arc::new(move |msg: JsonRpcMessage| {
        if matches!(msg, JsonRpcMessage::Response(_)) {
            if let Some(sender) = tx.lock().unwrap().take() {
                let _ = sender.send(msg);
            }
        }
    }));

    wrapper.clone().start().await?;
    wrapper
        .clone()
        .send(JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: serde_json::Value::String(uuid::Uuid::new_v4().to_string()),
            method,
            params: Some(params),
        }))
        .await?;

    let response = tokio::time::timeout(Duration::from_secs(60), rx)
        .await
        .context("timed out waiting for a response")?
        .context("response channel closed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    wrapper.clone().close().await?;
    ctx.relay_pool.clone().disconnect().await;
    Ok(())
}
