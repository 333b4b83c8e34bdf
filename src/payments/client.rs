//! Client Payments Wrapper (§4.Q): sits in front of a `ClientTransport`,
//! intercepting `notifications/payment_required` to pay with a configured
//! handler and emitting synthetic progress so the MCP idle timer doesn't
//! fire while a payment settles.

use super::{PaymentHandler, PaymentRequiredParams};
use crate::error::BridgeResult;
use crate::jsonrpc::{notification, synthetic_error_response, JsonRpcMessage};
use crate::transport::client::ClientTransport;
use crate::transport::{OnClose, OnError, OnMessage, OriginalRequestContext, PendingRequest, Transport};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default interval for synthetic progress ticks: comfortably inside the
/// smallest plausible MCP idle timeout (§6 client payments config).
pub const DEFAULT_SYNTHETIC_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

pub type PaymentPolicy = Box<dyn Fn(&PaymentRequiredParams) -> bool + Send + Sync>;

pub struct ClientPaymentsWrapper {
    inner: Arc<ClientTransport>,
    handlers: Vec<Arc<dyn PaymentHandler>>,
    payment_policy: Option<PaymentPolicy>,
    synthetic_progress_interval: Duration,
    in_flight_pay_reqs: Mutex<HashSet<String>>,
    progress_timers: Mutex<std::collections::HashMap<String, CancellationToken>>,
    on_message: Mutex<Option<OnMessage>>,
    on_error: Mutex<Option<OnError>>,
    on_close: Mutex<Option<OnClose>>,
}

impl ClientPaymentsWrapper {
    pub fn wrap(
        inner: Arc<ClientTransport>,
        handlers: Vec<Arc<dyn PaymentHandler>>,
        payment_policy: Option<PaymentPolicy>,
        synthetic_progress_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            handlers,
            payment_policy,
            synthetic_progress_interval,
            in_flight_pay_reqs: Mutex::new(HashSet::new()),
            progress_timers: Mutex::new(std::collections::HashMap::new()),
            on_message: Mutex::new(None),
            on_error: Mutex::new(None),
            on_close: Mutex::new(None),
        })
    }

    pub fn set_on_message(&self, f: OnMessage) {
        *self.on_message.lock().unwrap() = Some(f);
    }
    pub fn set_on_error(&self, f: OnError) {
        *self.on_error.lock().unwrap() = Some(f);
    }
    pub fn set_on_close(&self, f: OnClose) {
        *self.on_close.lock().unwrap() = Some(f);
    }

    fn emit_message(&self, msg: JsonRpcMessage) {
        if let Some(cb) = self.on_message.lock().unwrap().clone() {
            cb(msg);
        }
    }
    fn emit_error(&self, err: crate::error::BridgeError) {
        if let Some(cb) = self.on_error.lock().unwrap().clone() {
            cb(err);
        }
    }

    fn handle_inbound(self: &Arc<Self>, msg: JsonRpcMessage, ctx: OriginalRequestContext) {
        match msg.method() {
            Some("notifications/payment_required") => self.clone().handle_payment_required(msg, ctx),
            Some("notifications/payment_rejected") => self.handle_payment_rejected(msg, ctx),
            Some("notifications/payment_accepted") => {
                self.clear_progress_timer(ctx.correlated_event_id.as_deref());
                self.emit_message(msg);
            }
            _ => self.emit_message(msg),
        }
    }

    fn handle_payment_required(self: Arc<Self>, msg: JsonRpcMessage, ctx: OriginalRequestContext) {
        // Always delivered to the MCP client, even if no handler can pay,
        // so the application can surface it (§7 user-visible behavior).
        self.emit_message(msg.clone());

        let Some(params) = msg.params().and_then(PaymentRequiredParams::from_value) else {
            return;
        };

        let pending = ctx
            .correlated_event_id
            .as_deref()
            .and_then(|id| self.inner.pending_request(id));

        if let (Some(pending), Some(ttl)) = (&pending, params.ttl) {
            if ttl > 0 {
                if let (Some(token), Some(correlated)) = (&pending.progress_token, &ctx.correlated_event_id) {
                    self.start_synthetic_progress(correlated.clone(), token.clone());
                }
            }
        }

        let Some(handler) = self.handlers.iter().find(|h| h.pmi() == params.pmi).cloned() else {
            return; // delivered unchanged above; no handler configured for this PMI
        };

        {
            let mut inflight = self.in_flight_pay_reqs.lock().unwrap();
            if inflight.contains(&params.pay_req) {
                return;
            }
            inflight.insert(params.pay_req.clone());
        }

        let decline_message = if !handler.can_handle(&params) {
            Some(crate::jsonrpc::MSG_PAYMENT_DECLINED_BY_CLIENT_HANDLER)
        } else if self.payment_policy.as_ref().is_some_and(|p| !p(&params)) {
            Some(crate::jsonrpc::MSG_PAYMENT_DECLINED_BY_CLIENT_POLICY)
        } else {
            None
        };
        if let Some(message) = decline_message {
            self.in_flight_pay_reqs.lock().unwrap().remove(&params.pay_req);
            self.clear_progress_timer(ctx.correlated_event_id.as_deref());
            self.decline(&params, pending.as_ref(), message);
            return;
        }

        let this = self.clone();
        let req = params.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(&req).await {
                this.emit_error(e);
            }
            this.in_flight_pay_reqs.lock().unwrap().remove(&req.pay_req);
        });
    }

    /// Synthesize the JSON-RPC error a declined payment_required produces
    /// (§4.Q): only possible when the notification was correlated to a
    /// request the client is still waiting on. `message` distinguishes a
    /// handler declining the PMI from the configured policy rejecting it.
    fn decline(&self, params: &PaymentRequiredParams, pending: Option<&PendingRequest>, message: &str) {
        let Some(pending) = pending else { return };
        let data = json!({
            "pmi": params.pmi,
            "amount": params.amount,
            "method": pending.method,
            "capability": pending.capability,
        });
        let response = synthetic_error_response(pending.original_request_id.clone(), message, Some(data));
        self.emit_message(response);
    }

    fn handle_payment_rejected(&self, msg: JsonRpcMessage, ctx: OriginalRequestContext) {
        self.clear_progress_timer(ctx.correlated_event_id.as_deref());

        let Some(correlated) = ctx.correlated_event_id.as_deref() else {
            self.emit_message(msg); // uncorrelated: deliver as-is, nothing to suppress against
            return;
        };
        let Some(pending) = self.inner.pending_request(correlated) else {
            self.emit_message(msg);
            return;
        };

        let reason = msg.params().and_then(|p| p.get("message")).and_then(Value::as_str);
        let message = match reason {
            Some(r) => format!("{}: {r}", crate::jsonrpc::MSG_PAYMENT_REJECTED),
            None => crate::jsonrpc::MSG_PAYMENT_REJECTED.to_string(),
        };
        self.emit_message(synthetic_error_response(pending.original_request_id, message, None));
    }

    /// Emit one `notifications/progress` immediately (resets the MCP idle
    /// timer synchronously, P11), then tick on an interval until cleared by
    /// the matching response, `payment_accepted`, or `payment_rejected`.
    fn start_synthetic_progress(self: &Arc<Self>, correlated_event_id: String, progress_token: String) {
        let cancel = CancellationToken::new();
        self.progress_timers
            .lock()
            .unwrap()
            .insert(correlated_event_id.clone(), cancel.clone());

        self.emit_message(notification(
            "notifications/progress",
            json!({"progressToken": progress_token.clone(), "progress": 0, "total": null}),
        ));

        let this = self.clone();
        let interval = self.synthetic_progress_interval;
        tokio::spawn(async move {
            let mut tick = 1u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        this.emit_message(notification(
                            "notifications/progress",
                            json!({"progressToken": progress_token, "progress": tick, "total": null}),
                        ));
                        tick += 1;
                    }
                }
            }
        });
    }

    fn clear_progress_timer(&self, correlated_event_id: Option<&str>) {
        let Some(id) = correlated_event_id else { return };
        if let Some(cancel) = self.progress_timers.lock().unwrap().remove(id) {
            cancel.cancel();
        }
    }
}

#[async_trait::async_trait]
impl Transport for ClientPaymentsWrapper {
    async fn start(self: Arc<Self>) -> BridgeResult<()> {
        self.inner
            .set_client_pmis(self.handlers.iter().map(|h| h.pmi().to_string()).collect());

        let this = self.clone();
        self.inner
            .set_on_message_with_context(Arc::new(move |msg, ctx| this.clone().handle_inbound(msg, ctx)));
        let this = self.clone();
        self.inner.set_on_error(Arc::new(move |e| this.emit_error(e)));
        let this = self.clone();
        self.inner.set_on_close(Arc::new(move || {
            if let Some(cb) = this.on_close.lock().unwrap().clone() {
                cb();
            }
        }));

        self.inner.clone().start().await
    }

    async fn send(self: Arc<Self>, message: JsonRpcMessage) -> BridgeResult<()> {
        self.inner.clone().send(message).await
    }

    async fn close(self: Arc<Self>) -> BridgeResult<()> {
        for (_, cancel) in self.progress_timers.lock().unwrap().drain() {
            cancel.cancel();
        }
        self.inner.clone().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{tag, Event, KIND_APPLICATION_MESSAGE};
    use crate::event::codec::{EncryptionMode, GiftWrapMode};
    use crate::jsonrpc::{JsonRpcMessage, JsonRpcRequest, JsonRpcVersion};
    use crate::payments::FakePaymentHandler;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::PrivateKeySigner;
    use crate::transport::client::ClientTransportConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(id: i64, method: &str) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion,
            id: Value::from(id),
            method: method.to_string(),
            params: None,
        })
    }

    async fn make_wrapper() -> (Arc<ClientPaymentsWrapper>, Arc<FakeRelayPool>, Arc<PrivateKeySigner>) {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        let client = ClientTransport::new(
            signer.clone(),
            pool.clone(),
            ClientTransportConfig {
                server_pubkey: "server".into(),
                is_stateless: false,
                strict_ephemeral: false,
                encryption_mode: EncryptionMode::Disabled,
                gift_wrap_mode: GiftWrapMode::Persistent,
            },
        );
        let handlers: Vec<Arc<dyn PaymentHandler>> = vec![Arc::new(FakePaymentHandler::new("fake"))];
        let wrapper = ClientPaymentsWrapper::wrap(client, handlers, None, Duration::from_millis(20));
        wrapper.clone().start().await.unwrap();
        (wrapper, pool, signer)
    }

    #[tokio::test]
    async fn payment_required_is_delivered_and_handler_invoked() {
        let (wrapper, pool, signer) = make_wrapper().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        wrapper.set_on_message(Arc::new(move |m| received2.lock().unwrap().push(m)));

        wrapper.clone().send(request(1, "tools/call")).await.unwrap();
        let published = pool.published_events();
        let request_event_id = published[0].id.clone();

        let notif = crate::event::UnsignedEvent {
            pubkey: "server".into(),
            created_at: chrono::Utc::now().timestamp(),
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", signer.get_public_key()), tag("e", &request_event_id)],
            content: json!({"jsonrpc":"2.0","method":"notifications/payment_required","params":{"amount":1,"pay_req":"inv1","pmi":"fake","ttl":60}}).to_string(),
        };
        let signed = Event {
            id: notif.id_hex(),
            pubkey: notif.pubkey,
            created_at: notif.created_at,
            kind: notif.kind,
            tags: notif.tags,
            content: notif.content,
            sig: String::new(),
        };
        pool.deliver(signed);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(received.lock().unwrap().len(), 2); // payment_required + synthetic progress
    }

    #[tokio::test]
    async fn declined_by_policy_synthesizes_client_error() {
        let (wrapper, pool, signer) = make_wrapper().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        wrapper.set_on_message(Arc::new(move |m| received2.lock().unwrap().push(m)));

        wrapper.clone().send(request(7, "tools/call")).await.unwrap();
        let request_event_id = pool.published_events()[0].id.clone();

        let decline_wrapper = ClientPaymentsWrapper::wrap(
            wrapper.inner.clone(),
            vec![Arc::new(FakePaymentHandler::new("fake"))],
            Some(Box::new(|_req| false)),
            Duration::from_secs(5),
        );
        let received3 = Arc::new(AtomicUsize::new(0));
        let received3b = received3.clone();
        decline_wrapper.set_on_message(Arc::new(move |_m| {
            received3b.fetch_add(1, Ordering::SeqCst);
        }));
        decline_wrapper.handle_inbound(
            crate::jsonrpc::notification(
                "notifications/payment_required",
                json!({"amount":1,"pay_req":"inv2","pmi":"fake","ttl":60}),
            ),
            OriginalRequestContext {
                event_id: "outer".into(),
                correlated_event_id: Some(request_event_id),
                client_pubkey: Some(signer.get_public_key()),
            },
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(received3.load(Ordering::SeqCst), 2); // payment_required + declined error
    }
}
