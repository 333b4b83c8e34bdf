//! BOLT11 Zap Processor (§4.W): implements `PaymentProcessor` for the same
//! `bitcoin-lightning-bolt11` PMI via NIP-57 zaps against a lightning
//! address, as an alternative rail to the NWC processor.
//!
//! The LNURL-pay handshake (GET well-known metadata, POST callback with the
//! signed zap request embedded) is hand-rolled over `reqwest` + `serde_json`
//! rather than through a dedicated LNURL crate, grounded on the same
//! direct-HTTP idiom `signer/mod.rs` uses for `nostr` primitives: touch the
//! wire format directly at the one seam that needs it.

use crate::error::{BridgeError, BridgeResult};
use crate::event::{tag, Event, UnsignedEvent, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST};
use crate::payments::{CreatedPayment, PaymentProcessor, PriceQuote};
use crate::relay::{Filter, RelayPool};
use crate::signer::Signer;
use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

pub const PMI_BOLT11: &str = "bitcoin-lightning-bolt11";
/// Zap receipts can lag well behind the invoice being paid out-of-band;
/// give them more room than the NWC poll schedule.
const DEFAULT_TTL_SECONDS: u64 = 900;
/// Resource-safety backstop only: the middleware's own TTL timeout
/// (`DEFAULT_TTL_SECONDS`) is what actually bounds a real request.
const INTERNAL_VERIFY_CEILING: Duration = Duration::from_secs(1_800);

struct PendingZap {
    expected_zapper_pubkey: String,
    since: i64,
}

pub struct ZapPaymentProcessor {
    signer: Arc<dyn Signer>,
    relay_pool: Arc<dyn RelayPool>,
    http: reqwest::Client,
    lightning_address: String,
    zap_relays: Vec<String>,
    pending: Mutex<HashMap<String, PendingZap>>,
}

impl ZapPaymentProcessor {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay_pool: Arc<dyn RelayPool>,
        lightning_address: impl Into<String>,
        zap_relays: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            signer,
            relay_pool,
            http: reqwest::Client::new(),
            lightning_address: lightning_address.into(),
            zap_relays,
            pending: Mutex::new(HashMap::new()),
        })
    }

    async fn fetch_lnurl_pay_params(&self) -> BridgeResult<Value> {
        let (user, domain) = self
            .lightning_address
            .split_once('@')
            .ok_or_else(|| BridgeError::PaymentCreateFailed(format!("not a lightning address: {}", self.lightning_address)))?;
        let url = format!("https://{domain}/.well-known/lnurlp/{user}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::PaymentCreateFailed(format!("lnurlp fetch failed: {e}")))?;
        resp.json::<Value>()
            .await
            .map_err(|e| BridgeError::PaymentCreateFailed(format!("lnurlp response was not JSON: {e}")))
    }
}

#[async_trait]
impl PaymentProcessor for ZapPaymentProcessor {
    fn pmi(&self) -> &str {
        PMI_BOLT11
    }

    async fn create_payment_required(
        &self,
        quote: &PriceQuote,
        request_event_id: &str,
        _client_pubkey: &str,
    ) -> BridgeResult<CreatedPayment> {
        let params = self.fetch_lnurl_pay_params().await?;

        let allows_nostr = params.get("allowsNostr").and_then(Value::as_bool).unwrap_or(false);
        let zapper_pubkey = params
            .get("nostrPubkey")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (Some(zapper_pubkey), true) = (zapper_pubkey, allows_nostr) else {
            return Err(BridgeError::PaymentCreateFailed(format!(
                "{} does not support NIP-57 zaps",
                self.lightning_address
            )));
        };

        let amount_msat = quote.amount.saturating_mul(1_000);
        let min_sendable = params.get("minSendable").and_then(Value::as_u64).unwrap_or(0);
        let max_sendable = params.get("maxSendable").and_then(Value::as_u64).unwrap_or(u64::MAX);
        if amount_msat < min_sendable || amount_msat > max_sendable {
            return Err(BridgeError::PaymentCreateFailed(format!(
                "amount {amount_msat} msat outside LNURL bounds [{min_sendable}, {max_sendable}]"
            )));
        }

        let callback = params
            .get("callback")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::PaymentCreateFailed("lnurlp response missing callback".into()))?;

        let mut tags = vec![
            tag("p", zapper_pubkey.clone()),
            tag("amount", amount_msat.to_string()),
        ];
        for relay in &self.zap_relays {
            tags.push(tag("relays", relay.clone()));
        }
        let zap_request_template = UnsignedEvent {
            pubkey: self.signer.get_public_key(),
            created_at: chrono::Utc::now().timestamp(),
            kind: KIND_ZAP_REQUEST,
            tags,
            content: quote.description.clone().unwrap_or_default(),
        };
        let zap_request = self.signer.sign_event(zap_request_template).await?;
        let zap_request_json = serde_json::to_string(&zap_request)?;

        let mut callback_url = reqwest::Url::parse(callback)
            .map_err(|e| BridgeError::PaymentCreateFailed(format!("bad LNURL callback URL: {e}")))?;
        callback_url
            .query_pairs_mut()
            .append_pair("amount", &amount_msat.to_string())
            .append_pair("nostr", &zap_request_json);

        let invoice_resp = self
            .http
            .get(callback_url)
            .send()
            .await
            .map_err(|e| BridgeError::PaymentCreateFailed(format!("LNURL callback failed: {e}")))?
            .json::<Value>()
            .await
            .map_err(|e| BridgeError::PaymentCreateFailed(format!("LNURL callback response was not JSON: {e}")))?;

        let invoice = invoice_resp
            .get("pr")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::PaymentCreateFailed("LNURL callback response missing pr".into()))?
            .to_string();

        self.pending.lock().unwrap().insert(
            invoice.clone(),
            PendingZap {
                expected_zapper_pubkey: zapper_pubkey,
                since: zap_request.created_at,
            },
        );
        let _ = request_event_id;

        Ok(CreatedPayment { pay_req: invoice, ttl_seconds: Some(DEFAULT_TTL_SECONDS) })
    }

    async fn verify_payment(&self, pay_req: &str, _request_event_id: &str) -> BridgeResult<Value> {
        let pending = self
            .pending
            .lock()
            .unwrap()
            .remove(pay_req)
            .ok_or_else(|| BridgeError::PaymentVerifyFailed("no pending zap for this invoice".into()))?;

        let expected_hash = payment_hash_of(pay_req);
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let pay_req_owned = pay_req.to_string();
        let filter = Filter::new()
            .kinds([KIND_ZAP_RECEIPT])
            .authors([pending.expected_zapper_pubkey.clone()])
            .since(pending.since);
        let sub = self
            .relay_pool
            .subscribe(
                vec![filter],
                Arc::new(move |ev: Event| {
                    if !receipt_matches(&ev, &pay_req_owned, expected_hash.as_deref()) {
                        return;
                    }
                    if let Some(sender) = tx.lock().unwrap().take() {
                        let _ = sender.send(ev);
                    }
                }),
                None,
            )
            .await;

        let outcome = tokio::time::timeout(INTERNAL_VERIFY_CEILING, rx).await;
        sub.unsubscribe().await;

        match outcome {
            Ok(Ok(event)) => Ok(json!({"zap_receipt_event_id": event.id})),
            Ok(Err(_)) => Err(BridgeError::PaymentVerifyFailed("zap receipt channel closed".into())),
            Err(_) => {
                warn!(pay_req, "zap receipt wait timed out");
                Err(BridgeError::PaymentTimeout(INTERNAL_VERIFY_CEILING))
            }
        }
    }
}

fn payment_hash_of(invoice: &str) -> Option<String> {
    Bolt11Invoice::from_str(invoice).ok().map(|inv| inv.payment_hash().to_string())
}

fn receipt_matches(receipt: &Event, pay_req: &str, expected_hash: Option<&str>) -> bool {
    let Some(bolt11) = receipt.find_tag_value("bolt11") else {
        return false;
    };
    if bolt11 == pay_req {
        return true;
    }
    match (expected_hash, payment_hash_of(bolt11)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tag as make_tag;

    fn receipt_with_bolt11(bolt11: &str) -> Event {
        Event {
            id: "receipt-1".into(),
            pubkey: "zapper".into(),
            created_at: 0,
            kind: KIND_ZAP_RECEIPT,
            tags: vec![make_tag("bolt11", bolt11)],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn receipt_matches_by_literal_invoice_string() {
        let receipt = receipt_with_bolt11("lnbc1...");
        assert!(receipt_matches(&receipt, "lnbc1...", None));
    }

    #[test]
    fn receipt_without_bolt11_tag_never_matches() {
        let receipt = Event {
            id: "r".into(),
            pubkey: "zapper".into(),
            created_at: 0,
            kind: KIND_ZAP_RECEIPT,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        assert!(!receipt_matches(&receipt, "lnbc1...", None));
    }
}
