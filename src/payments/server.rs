//! Server Payments Middleware (§4.P): sits between the server transport's
//! inbound requests and whatever forwards them onward (the gateway),
//! gating priced capabilities behind a create/publish/verify/forward
//! sequence that fails closed.

use super::{
    CreatedPayment, PriceContext, PriceQuote, PriceResolution, PricedCapability, ResolvePrice, PaymentProcessor,
};
use crate::jsonrpc::{capability_identifier, notification, synthetic_error_response, JsonRpcMessage};
use crate::transport::server::ServerTransport;
use crate::transport::{OnMessage, Transport};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// Floor used when neither the processor nor a dynamic quote supplies a
/// TTL (§4.P step 6 requires "a floor").
pub const DEFAULT_TTL_SECONDS: u64 = 60;

pub struct ServerPaymentsMiddleware {
    server: Arc<ServerTransport>,
    processors: Vec<Arc<dyn PaymentProcessor>>,
    priced: Vec<PricedCapability>,
    resolve_price: Option<ResolvePrice>,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ServerPaymentsMiddleware {
    pub fn new(
        server: Arc<ServerTransport>,
        processors: Vec<Arc<dyn PaymentProcessor>>,
        priced: Vec<PricedCapability>,
        resolve_price: Option<ResolvePrice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            processors,
            priced,
            resolve_price,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Wrap `downstream` (the gateway's real forwarding callback) with the
    /// payment gate, returning the callback to install as the server
    /// transport's `onmessage`.
    pub fn wrap(self: Arc<Self>, downstream: OnMessage) -> OnMessage {
        Arc::new(move |msg: JsonRpcMessage| {
            let this = self.clone();
            let downstream = downstream.clone();
            tokio::spawn(async move {
                this.on_message(msg, downstream).await;
            });
        })
    }

    async fn on_message(self: Arc<Self>, msg: JsonRpcMessage, downstream: OnMessage) {
        let JsonRpcMessage::Request(req) = &msg else {
            downstream(msg);
            return;
        };
        let method = req.method.clone();
        let identifier = capability_identifier(&method, req.params.as_ref());
        let Some(priced) = self.priced.iter().find(|p| p.matches(&method, identifier.as_deref())) else {
            downstream(msg);
            return;
        };

        let request_event_id = match &req.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        // Single-flight per request event id (P7): the first deliverer runs
        // the full sequence; redeliveries wait for it and then return,
        // since forward() already happened exactly once.
        let notify = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(&request_event_id) {
                Some(existing.clone())
            } else {
                inflight.insert(request_event_id.clone(), Arc::new(Notify::new()));
                None
            }
        };
        if let Some(notify) = notify {
            notify.notified().await;
            return;
        }

        let client_pubkey = self.server.route_client_pubkey(&request_event_id).unwrap_or_default();
        self.run_priced_request(msg, priced, &identifier, &request_event_id, &client_pubkey, downstream)
            .await;

        if let Some(notify) = self.inflight.lock().unwrap().remove(&request_event_id) {
            notify.notify_waiters();
        }
    }

    async fn run_priced_request(
        &self,
        msg: JsonRpcMessage,
        priced: &PricedCapability,
        identifier: &Option<String>,
        request_event_id: &str,
        client_pubkey: &str,
        downstream: OnMessage,
    ) {
        let quote = match &self.resolve_price {
            None => PriceQuote {
                amount: priced.amount,
                description: priced.description.clone(),
            },
            Some(resolver) => {
                let ctx = PriceContext {
                    capability: identifier.clone().unwrap_or_else(|| priced.method.clone()),
                    method: priced.method.clone(),
                    client_pubkey: client_pubkey.to_string(),
                    request_event_id: request_event_id.to_string(),
                };
                match resolver(&ctx) {
                    None => PriceQuote {
                        amount: priced.amount,
                        description: priced.description.clone(),
                    },
                    Some(PriceResolution::Quote { amount, description }) => PriceQuote { amount, description },
                    Some(PriceResolution::Reject { message }) => {
                        self.reject(request_event_id, client_pubkey, message).await;
                        return;
                    }
                }
            }
        };

        let client_pmis = self.server.route_client_pmis(request_event_id);
        let Some(processor) = self.select_processor(&client_pmis) else {
            warn!(request_event_id, "no payment processor configured for priced capability");
            self.reject(request_event_id, client_pubkey, Some("no payment processor available".into()))
                .await;
            return;
        };

        let created = match processor
            .create_payment_required(&quote, request_event_id, client_pubkey)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(request_event_id, error = %e, "createPaymentRequired failed, failing closed");
                return; // P8: fail-closed, no forward
            }
        };

        let ttl = created.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
        let _ = self
            .server
            .send_notification(
                client_pubkey,
                notification(
                    "notifications/payment_required",
                    payment_required_params(&quote, &created, processor.pmi(), ttl),
                ),
                Some(request_event_id),
            )
            .await;

        let verified = tokio::time::timeout(
            Duration::from_secs(ttl),
            processor.verify_payment(&created.pay_req, request_event_id),
        )
        .await;

        let meta = match verified {
            Ok(Ok(meta)) => meta,
            Ok(Err(e)) => {
                warn!(request_event_id, error = %e, "verifyPayment failed, failing closed");
                return; // P8
            }
            Err(_) => {
                warn!(request_event_id, ttl, "verifyPayment timed out, failing closed");
                return; // P9: TTL timeout, state already cleared by caller
            }
        };

        let _ = self
            .server
            .send_notification(
                client_pubkey,
                notification(
                    "notifications/payment_accepted",
                    json!({"amount": quote.amount, "pmi": processor.pmi(), "_meta": meta}),
                ),
                Some(request_event_id),
            )
            .await;

        downstream(msg);
    }

    async fn reject(&self, request_event_id: &str, client_pubkey: &str, message: Option<String>) {
        let _ = self
            .server
            .send_notification(
                client_pubkey,
                notification(
                    "notifications/payment_rejected",
                    json!({"message": message}),
                ),
                Some(request_event_id),
            )
            .await;
        let response = synthetic_error_response(
            Value::String(request_event_id.to_string()),
            crate::jsonrpc::MSG_PAYMENT_DECLINED_BY_SERVER_POLICY,
            None,
        );
        let _ = self.server.clone().send(response).await;
    }

    /// P10: intersect client-preferred PMIs (in client order) with the
    /// configured server processors (in server order); fall back to the
    /// server's first processor when there's no overlap or no preference.
    fn select_processor(&self, client_pmis: &[String]) -> Option<&Arc<dyn PaymentProcessor>> {
        for pmi in client_pmis {
            if let Some(p) = self.processors.iter().find(|p| p.pmi() == pmi) {
                return Some(p);
            }
        }
        self.processors.first()
    }
}

fn payment_required_params(quote: &PriceQuote, created: &CreatedPayment, pmi: &str, ttl: u64) -> Value {
    json!({
        "amount": quote.amount,
        "pay_req": created.pay_req,
        "pmi": pmi,
        "description": quote.description,
        "ttl": ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::AuthorizationPolicy;
    use crate::event::{tag, KIND_APPLICATION_MESSAGE};
    use crate::payments::FakePaymentProcessor;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::{PrivateKeySigner, Signer};
    use crate::transport::server::ServerTransportConfig;
    use crate::transport::Transport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn make_server() -> (Arc<ServerTransport>, Arc<PrivateKeySigner>, Arc<FakeRelayPool>) {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        let authz = Arc::new(AuthorizationPolicy::new(None, vec![], false));
        let server = ServerTransport::new(signer.clone(), pool.clone(), authz, ServerTransportConfig::default());
        server.clone().start().await.unwrap();
        (server, signer, pool)
    }

    fn priced_request_event(client: &PrivateKeySigner, server_pubkey: &str, request_id: i64) -> crate::event::UnsignedEvent {
        let content = json!({"jsonrpc":"2.0","id":request_id,"method":"tools/call","params":{"name":"add"}}).to_string();
        crate::event::UnsignedEvent {
            pubkey: client.get_public_key(),
            created_at: chrono::Utc::now().timestamp(),
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", server_pubkey)],
            content,
        }
    }

    #[tokio::test]
    async fn priced_capability_gates_forward_until_paid() {
        let (server, signer, pool) = make_server().await;
        let client = PrivateKeySigner::generate();
        let event = priced_request_event(&client, &signer.get_public_key(), 1);
        let signed = client.sign_event(event).await.unwrap();

        let forwarded = Arc::new(AtomicUsize::new(0));
        let forwarded2 = forwarded.clone();
        let downstream: OnMessage = Arc::new(move |_msg| {
            forwarded2.fetch_add(1, Ordering::SeqCst);
        });

        let processors: Vec<Arc<dyn PaymentProcessor>> = vec![Arc::new(FakePaymentProcessor::new("fake"))];
        let priced = vec![PricedCapability {
            method: "tools/call".into(),
            name: Some("add".into()),
            amount: 1,
            description: None,
        }];
        let middleware = ServerPaymentsMiddleware::new(server.clone(), processors, priced, None);
        server.set_on_message(middleware.wrap(downstream));

        pool.deliver(signed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
        let published = pool.published_events();
        assert!(published.len() >= 2); // payment_required + payment_accepted
    }

    #[tokio::test]
    async fn pmi_selection_prefers_client_order_then_server_order() {
        let (server, _signer, _pool) = make_server().await;
        let processors: Vec<Arc<dyn PaymentProcessor>> = vec![
            Arc::new(FakePaymentProcessor::new("B")),
            Arc::new(FakePaymentProcessor::new("C")),
        ];
        let middleware = ServerPaymentsMiddleware::new(server, processors, vec![], None);
        let selected = middleware.select_processor(&["A".to_string(), "B".to_string()]);
        assert_eq!(selected.unwrap().pmi(), "B");
        let selected_empty = middleware.select_processor(&[]);
        assert_eq!(selected_empty.unwrap().pmi(), "B");
    }
}
