//! Base Transport (§4.B): state and operations shared by the client and
//! server transports — connect/disconnect, bounded-concurrency subscribe,
//! publish, and the sign-then-publish sequence every outbound MCP message
//! goes through.

use crate::error::{BridgeError, BridgeResult};
use crate::event::codec::{encrypt_gift_wrap, mcp_to_event_content, EncryptionMode, GiftWrapMode};
use crate::event::{Event, Tag, KIND_APPLICATION_MESSAGE};
use crate::jsonrpc::JsonRpcMessage;
use crate::relay::{Filter, OnEose, RelayPool, Subscription};
use crate::signer::Signer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Default per-operation timeout for connect/disconnect/publish (§4.B).
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default inbound handler concurrency cap (§4.B, §5).
pub const DEFAULT_HANDLER_CONCURRENCY: usize = 5;

pub struct BaseTransport {
    pub signer: Arc<dyn Signer>,
    pub relay_pool: Arc<dyn RelayPool>,
    pub encryption_mode: EncryptionMode,
    pub gift_wrap_mode: GiftWrapMode,
    concurrency: Arc<Semaphore>,
    subscriptions: Mutex<Vec<Subscription>>,
    op_timeout: Duration,
}

impl BaseTransport {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay_pool: Arc<dyn RelayPool>,
        encryption_mode: EncryptionMode,
        gift_wrap_mode: GiftWrapMode,
    ) -> Self {
        Self {
            signer,
            relay_pool,
            encryption_mode,
            gift_wrap_mode,
            concurrency: Arc::new(Semaphore::new(DEFAULT_HANDLER_CONCURRENCY)),
            subscriptions: Mutex::new(Vec::new()),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub async fn connect(&self) -> BridgeResult<()> {
        tokio::time::timeout(self.op_timeout, self.relay_pool.clone().connect())
            .await
            .map_err(|_| BridgeError::ConnectFailed("timed out".into()))
    }

    pub async fn disconnect(&self) -> BridgeResult<()> {
        tokio::time::timeout(self.op_timeout, self.relay_pool.clone().disconnect())
            .await
            .map_err(|_| BridgeError::ConnectFailed("disconnect timed out".into()))
    }

    /// Register a subscription whose deliveries run through the bounded
    /// task queue (§4.B): each event is handed to its own task gated by a
    /// semaphore, so a slow handler never blocks delivery of other events,
    /// and a handler panic/error never aborts the subscription.
    pub async fn subscribe<F>(&self, filters: Vec<Filter>, on_event: F, on_eose: Option<OnEose>)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let concurrency = self.concurrency.clone();
        let on_event = Arc::new(on_event);
        let wrapped: crate::relay::OnEvent = Arc::new(move |event| {
            let concurrency = concurrency.clone();
            let on_event = on_event.clone();
            tokio::spawn(async move {
                let Ok(_permit) = concurrency.acquire_owned().await else {
                    return;
                };
                on_event(event);
            });
        });
        let sub = self.relay_pool.subscribe(filters, wrapped, on_eose).await;
        self.subscriptions.lock().unwrap().push(sub);
    }

    pub async fn unsubscribe_all(&self) {
        let subs = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        for sub in subs {
            sub.unsubscribe().await;
        }
    }

    pub async fn publish_event(&self, event: Event, cancel: CancellationToken) -> BridgeResult<()> {
        tokio::time::timeout(self.op_timeout, self.relay_pool.clone().publish(event, cancel))
            .await
            .map_err(|_| BridgeError::PublishFailed("timed out".into()))?
    }

    /// Sign `msg` (optionally sealing it in a gift wrap), invoking
    /// `on_event_created` synchronously right after signing and before
    /// publish — so correlation state is registered race-free even if the
    /// relay echoes a response faster than `publish` returns (§4.B, §5).
    ///
    /// `inner_kind` tags the signed message event itself (almost always
    /// [`KIND_APPLICATION_MESSAGE`] — the capability-announcement callers
    /// are the exception, publishing unwrapped with their own listing
    /// kind). `gift_wrap_ephemeral` selects the *outer* wrap kind when
    /// `is_encrypted` is set; it has no effect otherwise. Callers decide
    /// this flag themselves rather than it being inferred from
    /// `self.gift_wrap_mode`, since a client's ephemeral/persistent choice
    /// can depend on what the server advertised.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_mcp_message<F>(
        &self,
        msg: &JsonRpcMessage,
        recipient_pubkey: &str,
        inner_kind: u16,
        gift_wrap_ephemeral: bool,
        tags: Vec<Tag>,
        is_encrypted: bool,
        on_event_created: F,
    ) -> BridgeResult<()>
    where
        F: FnOnce(&str),
    {
        let pubkey = self.signer.get_public_key();
        let now = chrono::Utc::now().timestamp();
        let template = mcp_to_event_content(msg, &pubkey, inner_kind, tags, now)?;
        let inner = self.signer.sign_event(template).await?;
        on_event_created(&inner.id);

        let outgoing = if is_encrypted {
            encrypt_gift_wrap(&inner, recipient_pubkey, gift_wrap_ephemeral, now).await?
        } else {
            inner
        };
        self.publish_event(outgoing, CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KIND_APPLICATION_MESSAGE;
    use crate::jsonrpc::JsonRpcMessage;
    use crate::relay::fake::FakeRelayPool;
    use crate::signer::PrivateKeySigner;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_request() -> JsonRpcMessage {
        JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).unwrap()
    }

    #[tokio::test]
    async fn send_mcp_message_invokes_on_event_created_before_publish_returns() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        let transport = BaseTransport::new(signer, pool.clone(), EncryptionMode::Disabled, GiftWrapMode::Auto);

        let created = Arc::new(Mutex::new(None));
        let created2 = created.clone();
        transport
            .send_mcp_message(
                &sample_request(),
                "recipient",
                KIND_APPLICATION_MESSAGE,
                false,
                vec![],
                false,
                move |id| *created2.lock().unwrap() = Some(id.to_string()),
            )
            .await
            .unwrap();

        assert!(created.lock().unwrap().is_some());
        assert_eq!(pool.published_events().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_runs_handlers_with_bounded_concurrency() {
        let signer = Arc::new(PrivateKeySigner::generate());
        let pool = FakeRelayPool::new();
        pool.clone().connect().await;
        let transport = BaseTransport::new(signer, pool.clone(), EncryptionMode::Disabled, GiftWrapMode::Auto);

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        transport
            .subscribe(
                vec![Filter::new().kinds([KIND_APPLICATION_MESSAGE])],
                move |_event| {
                    count2.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .await;

        for i in 0..3 {
            pool.deliver(Event {
                id: format!("ev{i}"),
                pubkey: "server".into(),
                created_at: 0,
                kind: KIND_APPLICATION_MESSAGE,
                tags: vec![],
                content: "{}".into(),
                sig: String::new(),
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
