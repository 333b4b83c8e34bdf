//! Payments capability (§4.P/Q/W): the processor/handler ports the server
//! middleware and client wrapper depend on, implemented by the fake
//! processors used in tests and by the NWC/zap processors in `crate::wallet`.

pub mod client;
pub mod server;

use crate::error::BridgeResult;
use async_trait::async_trait;
use serde_json::Value;

/// A capability priced by `{method, name?}`, matching the `§4.A` exclusion
/// shape exactly so the same `(method, capability_identifier)` match logic
/// decides both authorization bypass and pricing.
#[derive(Debug, Clone)]
pub struct PricedCapability {
    pub method: String,
    pub name: Option<String>,
    pub amount: u64,
    pub description: Option<String>,
}

impl PricedCapability {
    pub fn matches(&self, method: &str, identifier: Option<&str>) -> bool {
        if self.method != method {
            return false;
        }
        match (&self.name, identifier) {
            (None, _) => true,
            (Some(n), Some(id)) => id.ends_with(n.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Everything a `resolvePrice` callback or a `createPaymentRequired` call
/// needs to know about the request being priced (§4.P step 3).
#[derive(Debug, Clone)]
pub struct PriceContext {
    pub capability: String,
    pub method: String,
    pub client_pubkey: String,
    pub request_event_id: String,
}

/// Either a price quote or an outright refusal, returned by an optional
/// dynamic pricing resolver (§4.P step 3).
pub enum PriceResolution {
    Quote { amount: u64, description: Option<String> },
    Reject { message: Option<String> },
}

pub type ResolvePrice = Box<dyn Fn(&PriceContext) -> Option<PriceResolution> + Send + Sync>;

/// A pending payment's computed price, regardless of whether it came from a
/// static `PricedCapability` or a `resolvePrice` override.
#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub amount: u64,
    pub description: Option<String>,
}

/// Server-side payment rail (§4.P, §4.W). One implementor per PMI
/// ("fake", "bitcoin-lightning-bolt11" via NWC or zap).
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    fn pmi(&self) -> &str;

    /// Create an invoice/payment-request for `quote`, returning
    /// `(pay_req, ttl_seconds)`. Called at most once per `request_event_id`
    /// even under concurrent redelivery (§4.P step 8).
    async fn create_payment_required(
        &self,
        quote: &PriceQuote,
        request_event_id: &str,
        client_pubkey: &str,
    ) -> BridgeResult<CreatedPayment>;

    /// Block until `pay_req` is settled or the deadline (bound by the
    /// middleware's TTL timeout) elapses. Concurrent calls for the same
    /// `pay_req` MUST be deduplicated by the processor (§4.W NWC: LRU of
    /// in-flight verifications).
    async fn verify_payment(&self, pay_req: &str, request_event_id: &str) -> BridgeResult<Value>;
}

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub pay_req: String,
    pub ttl_seconds: Option<u64>,
}

/// Client-side counterpart (§4.Q). One implementor per PMI the client is
/// willing to pay with.
#[async_trait]
pub trait PaymentHandler: Send + Sync {
    fn pmi(&self) -> &str;

    /// Cheap synchronous pre-check; returning `false` declines without
    /// invoking `handle` (§4.Q).
    fn can_handle(&self, _req: &PaymentRequiredParams) -> bool {
        true
    }

    /// Pay the invoice described by `req`. Errors are caught by the wrapper
    /// and routed to `onerror`; they never block delivery of the original
    /// notification.
    async fn handle(&self, req: &PaymentRequiredParams) -> BridgeResult<()>;
}

/// Parsed `notifications/payment_required` params (§6).
#[derive(Debug, Clone)]
pub struct PaymentRequiredParams {
    pub amount: u64,
    pub pay_req: String,
    pub pmi: String,
    pub description: Option<String>,
    pub ttl: Option<u64>,
}

impl PaymentRequiredParams {
    pub fn from_value(v: &Value) -> Option<Self> {
        Some(Self {
            amount: v.get("amount")?.as_u64()?,
            pay_req: v.get("pay_req")?.as_str()?.to_string(),
            pmi: v.get("pmi")?.as_str()?.to_string(),
            description: v.get("description").and_then(|d| d.as_str()).map(str::to_string),
            ttl: v.get("ttl").and_then(|t| t.as_u64()),
        })
    }
}

/// A `PaymentHandler`/`PaymentProcessor` pair used in tests and local
/// development: always succeeds immediately with a fixed `pay_req`.
pub struct FakePaymentProcessor {
    pmi: String,
}

impl FakePaymentProcessor {
    pub fn new(pmi: impl Into<String>) -> Self {
        Self { pmi: pmi.into() }
    }
}

#[async_trait]
impl PaymentProcessor for FakePaymentProcessor {
    fn pmi(&self) -> &str {
        &self.pmi
    }

    async fn create_payment_required(
        &self,
        _quote: &PriceQuote,
        request_event_id: &str,
        _client_pubkey: &str,
    ) -> BridgeResult<CreatedPayment> {
        Ok(CreatedPayment {
            pay_req: format!("fake-invoice-{request_event_id}"),
            ttl_seconds: Some(60),
        })
    }

    async fn verify_payment(&self, _pay_req: &str, _request_event_id: &str) -> BridgeResult<Value> {
        Ok(Value::Object(Default::default()))
    }
}

pub struct FakePaymentHandler {
    pmi: String,
}

impl FakePaymentHandler {
    pub fn new(pmi: impl Into<String>) -> Self {
        Self { pmi: pmi.into() }
    }
}

#[async_trait]
impl PaymentHandler for FakePaymentHandler {
    fn pmi(&self) -> &str {
        &self.pmi
    }

    async fn handle(&self, _req: &PaymentRequiredParams) -> BridgeResult<()> {
        Ok(())
    }
}
