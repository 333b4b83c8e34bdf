//! BOLT11 NWC Processor (§4.W): implements `PaymentProcessor` for the
//! `bitcoin-lightning-bolt11` PMI by driving a `Nip47Client`'s
//! `make_invoice`/`lookup_invoice` calls.
//!
//! Grounded on `payments/server.rs`'s fail-closed create/verify split and
//! `relay/mod.rs`'s jittered backoff schedule, adapted from a reconnect delay
//! sequence to a settlement-poll delay sequence.

use super::Nip47Client;
use crate::error::{BridgeError, BridgeResult};
use crate::lru_store::LruStore;
use crate::payments::{CreatedPayment, PaymentHandler, PaymentProcessor, PaymentRequiredParams, PriceQuote};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::warn;

pub const PMI_BOLT11: &str = "bitcoin-lightning-bolt11";
const DEFAULT_TTL_SECONDS: u64 = 60;
const INVOICE_HASH_CACHE_CAPACITY: usize = 10_000;

/// Polling backoff, floored by the configured minimum interval (§4.W).
const POLL_SCHEDULE_MS: [u64; 9] = [500, 750, 1_000, 1_500, 2_500, 4_000, 6_500, 10_000, 15_000];

pub struct NwcPaymentProcessor {
    client: Arc<Nip47Client>,
    poll_floor: Duration,
    invoice_hash_cache: Mutex<LruStore<String, String>>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<Result<Value, String>>>>>,
}

impl NwcPaymentProcessor {
    pub fn new(client: Arc<Nip47Client>, poll_floor_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            client,
            poll_floor: Duration::from_millis(poll_floor_ms),
            invoice_hash_cache: Mutex::new(LruStore::new(INVOICE_HASH_CACHE_CAPACITY)),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    async fn poll_until_settled(&self, pay_req: &str) -> BridgeResult<Value> {
        let payment_hash = self
            .invoice_hash_cache
            .lock()
            .unwrap()
            .peek(&pay_req.to_string())
            .cloned();

        let mut total_wait = Duration::ZERO;
        for raw_delay_ms in POLL_SCHEDULE_MS {
            let delay = Duration::from_millis(raw_delay_ms).max(self.poll_floor);
            let lookup = self
                .client
                .lookup_invoice(payment_hash.as_deref(), Some(pay_req))
                .await?;

            if is_terminal_failure(&lookup) {
                return Err(BridgeError::PaymentVerifyFailed(format!(
                    "invoice {}",
                    lookup.get("state").and_then(Value::as_str).unwrap_or("failed")
                )));
            }
            if is_settled(&lookup) {
                let hash = lookup.get("payment_hash").and_then(Value::as_str).map(str::to_string);
                return Ok(json!({"payment_hash": hash}));
            }

            total_wait += delay;
            tokio::time::sleep(delay).await;
        }
        Err(BridgeError::PaymentTimeout(total_wait))
    }
}

fn is_settled(v: &Value) -> bool {
    v.get("state").and_then(Value::as_str) == Some("settled")
        || v.get("settled_at").map(|x| !x.is_null()).unwrap_or(false)
        || v.get("preimage").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false)
}

fn is_terminal_failure(v: &Value) -> bool {
    matches!(v.get("state").and_then(Value::as_str), Some("expired") | Some("failed"))
}

#[async_trait]
impl PaymentProcessor for NwcPaymentProcessor {
    fn pmi(&self) -> &str {
        PMI_BOLT11
    }

    async fn create_payment_required(
        &self,
        quote: &PriceQuote,
        _request_event_id: &str,
        _client_pubkey: &str,
    ) -> BridgeResult<CreatedPayment> {
        let amount_msat = quote.amount.saturating_mul(1_000);
        let result = self
            .client
            .make_invoice(amount_msat, quote.description.as_deref(), DEFAULT_TTL_SECONDS)
            .await?;
        let invoice = result
            .get("invoice")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::PaymentCreateFailed("make_invoice response missing invoice".into()))?
            .to_string();
        if let Some(hash) = result.get("payment_hash").and_then(Value::as_str) {
            self.invoice_hash_cache.lock().unwrap().insert(invoice.clone(), hash.to_string());
        }
        Ok(CreatedPayment { pay_req: invoice, ttl_seconds: Some(DEFAULT_TTL_SECONDS) })
    }

    async fn verify_payment(&self, pay_req: &str, _request_event_id: &str) -> BridgeResult<Value> {
        // Concurrent verifyPayment calls for the same invoice share one
        // wallet round trip (S4): the first caller to register the cell
        // drives `poll_until_settled`; later callers await the same cell.
        let cell = {
            let mut inflight = self.in_flight.lock().unwrap();
            inflight
                .entry(pay_req.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async { self.poll_until_settled(pay_req).await.map_err(|e| e.to_string()) })
            .await
            .clone();

        self.in_flight.lock().unwrap().remove(pay_req);

        result.map_err(|e| {
            warn!(pay_req, error = %e, "bolt11 verifyPayment failed");
            BridgeError::PaymentVerifyFailed(e)
        })
    }
}

/// Client-side counterpart (§4.Q): pays `payment_required` notifications
/// carrying a `bitcoin-lightning-bolt11` `pay_req` by handing the BOLT11
/// invoice straight to the connected wallet's `pay_invoice`.
pub struct NwcPaymentHandler {
    client: Arc<Nip47Client>,
}

impl NwcPaymentHandler {
    pub fn new(client: Arc<Nip47Client>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

#[async_trait]
impl PaymentHandler for NwcPaymentHandler {
    fn pmi(&self) -> &str {
        PMI_BOLT11
    }

    fn can_handle(&self, req: &PaymentRequiredParams) -> bool {
        req.pmi == PMI_BOLT11
    }

    async fn handle(&self, req: &PaymentRequiredParams) -> BridgeResult<()> {
        self.client.pay_invoice(&req.pay_req).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_detection_accepts_any_settled_signal() {
        assert!(is_settled(&json!({"state": "settled"})));
        assert!(is_settled(&json!({"settled_at": 1_700_000_000})));
        assert!(is_settled(&json!({"preimage": "ab12"})));
        assert!(!is_settled(&json!({"state": "pending"})));
    }

    #[test]
    fn terminal_failure_states_are_expired_or_failed() {
        assert!(is_terminal_failure(&json!({"state": "expired"})));
        assert!(is_terminal_failure(&json!({"state": "failed"})));
        assert!(!is_terminal_failure(&json!({"state": "pending"})));
    }
}
