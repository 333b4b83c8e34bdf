//! NIP-47 Wallet Client (§4.W): request/response over the relay pool against
//! a single wallet pubkey. Requests are serialized per instance — the spec
//! requires at most one in-flight wallet request at a time — by holding an
//! async mutex across the full publish/await-response round trip.
//!
//! Grounded on `relay/mod.rs`'s single-flight rebuild pattern (a held lock
//! spanning an await point) and `payments/server.rs`'s create/publish/verify
//! sequencing.

pub mod nwc_processor;
pub mod zap_processor;

use crate::error::{BridgeError, BridgeResult};
use crate::event::{
    tag, UnsignedEvent, Event, KIND_WALLET_INFO, KIND_WALLET_NOTIFICATION,
    KIND_WALLET_NOTIFICATION_LEGACY, KIND_WALLET_REQUEST, KIND_WALLET_RESPONSE,
};
use crate::observability::LatencyTracker;
use crate::relay::{Filter, RelayPool, Subscription};
use crate::signer::Signer;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long a single `request()` round trip waits before giving up (§6).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Response subscriptions look back this far from "now" to tolerate clock
/// skew between the bridge and the wallet's relay (§6).
const RESPONSE_LOOKBACK_SECONDS: i64 = 5;

static NWC_URI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^nostr\+walletconnect://([0-9a-fA-F]{64})\?(.*)$").unwrap());

/// A parsed `nostr+walletconnect://<pubkey>?relay=...&secret=...` URI (§6).
#[derive(Debug, Clone)]
pub struct NwcConnection {
    pub wallet_pubkey: String,
    pub relays: Vec<String>,
    pub secret_hex: String,
}

impl NwcConnection {
    pub fn parse(uri: &str) -> BridgeResult<Self> {
        let caps = NWC_URI_RE
            .captures(uri.trim())
            .ok_or_else(|| BridgeError::Signer("malformed nostr+walletconnect URI".into()))?;
        let wallet_pubkey = caps[1].to_lowercase();
        let mut relays = Vec::new();
        let mut secret_hex = None;
        for pair in caps[2].split('&') {
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let v = percent_decode(v);
            match k {
                "relay" => relays.push(v),
                "secret" => secret_hex = Some(v),
                _ => {}
            }
        }
        let secret_hex = secret_hex
            .ok_or_else(|| BridgeError::Signer("nostr+walletconnect URI missing secret".into()))?;
        if relays.is_empty() {
            return Err(BridgeError::Signer("nostr+walletconnect URI missing relay".into()));
        }
        Ok(Self { wallet_pubkey, relays, secret_hex })
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// NIP-47 client bound to one wallet connection. `request()` is safe to call
/// concurrently; calls queue behind a single in-flight slot.
pub struct Nip47Client {
    signer: Arc<dyn Signer>,
    relay_pool: Arc<dyn RelayPool>,
    conn: NwcConnection,
    queue: AsyncMutex<()>,
    request_timeout: Duration,
}

impl Nip47Client {
    pub fn new(signer: Arc<dyn Signer>, relay_pool: Arc<dyn RelayPool>, conn: NwcConnection) -> Arc<Self> {
        Arc::new(Self {
            signer,
            relay_pool,
            conn,
            queue: AsyncMutex::new(()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn wallet_pubkey(&self) -> &str {
        &self.conn.wallet_pubkey
    }

    /// Send a `method`/`params` wallet request, wait for the correlated
    /// `wallet_response` event, and return its decoded `result`.
    pub async fn request(&self, method: &str, params: Value) -> BridgeResult<Value> {
        let _permit = self.queue.lock().await;
        let tracker = LatencyTracker::start(format!("wallet.{method}"));

        let body = json!({"method": method, "params": params}).to_string();
        let encrypted = self.signer.nip04_encrypt(&self.conn.wallet_pubkey, &body).await?;
        let now = chrono::Utc::now().timestamp();
        let template = UnsignedEvent {
            pubkey: self.signer.get_public_key(),
            created_at: now,
            kind: KIND_WALLET_REQUEST,
            tags: vec![tag("p", self.conn.wallet_pubkey.clone())],
            content: encrypted,
        };
        let signed = self.signer.sign_event(template).await?;

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(StdMutex::new(Some(tx)));
        let tx2 = tx.clone();
        let filter = Filter::new()
            .kinds([KIND_WALLET_RESPONSE])
            .authors([self.conn.wallet_pubkey.clone()])
            .e_tag(signed.id.clone())
            .since(now - RESPONSE_LOOKBACK_SECONDS);
        let sub = self
            .relay_pool
            .subscribe(
                vec![filter],
                Arc::new(move |ev: Event| {
                    if let Some(sender) = tx2.lock().unwrap().take() {
                        let _ = sender.send(ev);
                    }
                }),
                None,
            )
            .await;

        if let Err(e) = self.relay_pool.clone().publish(signed, CancellationToken::new()).await {
            sub.unsubscribe().await;
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.request_timeout, rx).await;
        sub.unsubscribe().await;

        let event = match outcome {
            Ok(Ok(ev)) => ev,
            Ok(Err(_)) => return Err(BridgeError::PaymentVerifyFailed("wallet response channel closed".into())),
            Err(_) => return Err(BridgeError::PaymentTimeout(self.request_timeout)),
        };

        let decrypted = self.signer.nip04_decrypt(&self.conn.wallet_pubkey, &event.content).await?;
        let value: Value = serde_json::from_str(&decrypted)?;

        if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
            return Err(BridgeError::PaymentVerifyFailed(err.to_string()));
        }
        if let Some(result_type) = value.get("result_type").and_then(Value::as_str) {
            if result_type != method {
                return Err(BridgeError::PaymentVerifyFailed(format!(
                    "unexpected result_type {result_type}, expected {method}"
                )));
            }
        }
        tracker.finish();
        Ok(value.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn make_invoice(&self, amount_msat: u64, description: Option<&str>, expiry_seconds: u64) -> BridgeResult<Value> {
        self.request(
            "make_invoice",
            json!({"amount": amount_msat, "description": description, "expiry": expiry_seconds}),
        )
        .await
    }

    pub async fn lookup_invoice(&self, payment_hash: Option<&str>, invoice: Option<&str>) -> BridgeResult<Value> {
        self.request("lookup_invoice", json!({"payment_hash": payment_hash, "invoice": invoice}))
            .await
    }

    /// Pay a BOLT11 invoice through the connected wallet (the client-side
    /// counterpart of `make_invoice`, used by [`nwc_processor::NwcPaymentHandler`]).
    pub async fn pay_invoice(&self, invoice: &str) -> BridgeResult<Value> {
        self.request("pay_invoice", json!({"invoice": invoice})).await
    }

    /// One-shot read of the wallet's `wallet_info` event (kind 13194); the
    /// supported notification types live in its `notifications` tag (§6).
    pub async fn fetch_info_notification_types(&self) -> BridgeResult<Vec<String>> {
        let filter = Filter::new()
            .kinds([KIND_WALLET_INFO])
            .authors([self.conn.wallet_pubkey.clone()])
            .limit(1);
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(StdMutex::new(Some(tx)));
        let tx2 = tx.clone();
        let sub = self
            .relay_pool
            .subscribe(
                vec![filter],
                Arc::new(move |ev: Event| {
                    if let Some(sender) = tx2.lock().unwrap().take() {
                        let _ = sender.send(ev);
                    }
                }),
                None,
            )
            .await;
        let outcome = tokio::time::timeout(self.request_timeout, rx).await;
        sub.unsubscribe().await;
        let Ok(Ok(event)) = outcome else {
            warn!(wallet = %self.conn.wallet_pubkey, "no wallet_info event found within timeout");
            return Ok(Vec::new());
        };
        Ok(event
            .find_tag_value("notifications")
            .map(|v| v.split(' ').map(str::to_string).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default())
    }

    /// Subscribe to NIP-47 notifications (`payment_received`, etc), decrypted
    /// and handed one at a time to `on_notification`.
    pub async fn subscribe_notifications(
        &self,
        on_notification: impl Fn(Value) + Send + Sync + 'static,
    ) -> Subscription {
        let signer = self.signer.clone();
        let wallet_pubkey = self.conn.wallet_pubkey.clone();
        let on_notification = Arc::new(on_notification);
        let filter = Filter::new()
            .kinds([KIND_WALLET_NOTIFICATION, KIND_WALLET_NOTIFICATION_LEGACY])
            .authors([wallet_pubkey.clone()])
            .p_tag(self.signer.get_public_key());
        self.relay_pool
            .subscribe(
                vec![filter],
                Arc::new(move |ev: Event| {
                    let signer = signer.clone();
                    let wallet_pubkey = wallet_pubkey.clone();
                    let on_notification = on_notification.clone();
                    tokio::spawn(async move {
                        match signer.nip04_decrypt(&wallet_pubkey, &ev.content).await {
                            Ok(plaintext) => match serde_json::from_str::<Value>(&plaintext) {
                                Ok(value) => on_notification(value),
                                Err(e) => warn!(error = %e, "wallet notification was not valid JSON"),
                            },
                            Err(e) => warn!(error = %e, "failed to decrypt wallet notification"),
                        }
                    });
                }),
                None,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nwc_uri() {
        let uri = "nostr+walletconnect://aa11bb22cc33dd44ee55ff66aa11bb22cc33dd44ee55ff66aa11bb22cc33dd44?relay=wss%3A%2F%2Frelay.example.com&secret=deadbeef";
        let conn = NwcConnection::parse(uri).unwrap();
        assert_eq!(conn.wallet_pubkey.len(), 64);
        assert_eq!(conn.relays, vec!["wss://relay.example.com".to_string()]);
        assert_eq!(conn.secret_hex, "deadbeef");
    }

    #[test]
    fn rejects_uri_missing_secret() {
        let uri = "nostr+walletconnect://aa11bb22cc33dd44ee55ff66aa11bb22cc33dd44ee55ff66aa11bb22cc33dd44?relay=wss%3A%2F%2Frelay.example.com";
        assert!(NwcConnection::parse(uri).is_err());
    }

    #[test]
    fn rejects_non_nwc_uri() {
        assert!(NwcConnection::parse("https://example.com").is_err());
    }
}
