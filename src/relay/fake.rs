//! In-memory `RelayPool` test double: an internal pub/sub bus that matches
//! filters the same way a real relay would, without any networking. Used by
//! transport/payments/gateway tests so P1-P4, P7-P13 and the S1-S6 scenarios
//! run deterministically.

use super::{Filter, OnEose, OnEvent, RelayPool, Subscription};
use crate::error::BridgeResult;
use crate::event::Event;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Descriptor {
    filters: Vec<Filter>,
    on_event: OnEvent,
}

#[derive(Default)]
pub struct FakeRelayPool {
    subs: Mutex<Vec<(String, Descriptor)>>,
    published: Mutex<Vec<Event>>,
    /// When > 0, `publish` fails this many times before succeeding — used to
    /// exercise the retry loop.
    pub fail_publishes_remaining: AtomicUsize,
    pub publish_attempts: AtomicUsize,
    pub connected: AtomicBool,
}

impl FakeRelayPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate a relay delivering `event` to every matching subscription.
    pub fn deliver(&self, event: Event) {
        let subs = self.subs.lock().unwrap();
        for (_, desc) in subs.iter() {
            if desc.filters.iter().any(|f| filter_matches(f, &event)) {
                (desc.on_event)(event.clone());
            }
        }
    }

    pub fn published_events(&self) -> Vec<Event> {
        self.published.lock().unwrap().clone()
    }
}

fn filter_matches(f: &Filter, e: &Event) -> bool {
    if !f.kinds.is_empty() && !f.kinds.contains(&e.kind) {
        return false;
    }
    if !f.authors.is_empty() && !f.authors.contains(&e.pubkey) {
        return false;
    }
    if !f.p_tags.is_empty() {
        let has = e
            .tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some("p") && f.p_tags.contains(&t[1]));
        if !has {
            return false;
        }
    }
    if !f.e_tags.is_empty() {
        let has = e
            .tags
            .iter()
            .any(|t| t.first().map(String::as_str) == Some("e") && f.e_tags.contains(&t[1]));
        if !has {
            return false;
        }
    }
    if let Some(since) = f.since {
        if e.created_at < since {
            return false;
        }
    }
    true
}

#[async_trait]
impl RelayPool for FakeRelayPool {
    async fn connect(self: Arc<Self>) {
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn disconnect(self: Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        self.subs.lock().unwrap().clear();
    }

    async fn publish(self: Arc<Self>, event: Event, cancel: CancellationToken) -> BridgeResult<()> {
        loop {
            self.publish_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_publishes_remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                self.published.lock().unwrap().push(event);
                return Ok(());
            }
            self.fail_publishes_remaining
                .store(remaining - 1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => return Err(crate::error::BridgeError::PublishFailed("aborted".into())),
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        }
    }

    async fn subscribe(
        self: &Arc<Self>,
        filters: Vec<Filter>,
        on_event: OnEvent,
        on_eose: Option<OnEose>,
    ) -> Subscription {
        let id = Uuid::new_v4().to_string();
        self.subs
            .lock()
            .unwrap()
            .push((id.clone(), Descriptor { filters, on_event }));
        if let Some(cb) = on_eose {
            cb();
        }
        Subscription {
            id,
            pool: self.clone() as Arc<dyn RelayPool>,
        }
    }

    async fn unsubscribe(&self, sub_id: &str) {
        self.subs.lock().unwrap().retain(|(id, _)| id != sub_id);
    }

    fn relay_urls(&self) -> Vec<String> {
        vec!["fake://relay".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{tag, KIND_APPLICATION_MESSAGE};

    fn sample_event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "server".into(),
            created_at: 0,
            kind: KIND_APPLICATION_MESSAGE,
            tags: vec![tag("p", "client")],
            content: "{}".into(),
            sig: String::new(),
        }
    }

    #[tokio::test]
    async fn delivers_matching_events_to_subscribers() {
        let pool = FakeRelayPool::new();
        pool.clone().connect().await;
        let received = Arc::new(Mutex::new(vec![]));
        let received2 = received.clone();
        let filter = Filter::new().kinds([KIND_APPLICATION_MESSAGE]).p_tag("client");
        let _sub = pool
            .subscribe(
                vec![filter],
                Arc::new(move |e| received2.lock().unwrap().push(e.id.clone())),
                None,
            )
            .await;
        pool.deliver(sample_event("ev1"));
        assert_eq!(received.lock().unwrap().as_slice(), ["ev1"]);
    }

    #[tokio::test]
    async fn publish_retries_until_success() {
        let pool = FakeRelayPool::new();
        pool.fail_publishes_remaining.store(2, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        pool.clone().publish(sample_event("p1"), cancel).await.unwrap();
        assert_eq!(pool.publish_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pool.published_events().len(), 1);
    }

    #[tokio::test]
    async fn publish_abort_stops_retry_loop() {
        let pool = FakeRelayPool::new();
        pool.fail_publishes_remaining.store(1_000_000, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            cancel2.cancel();
        });
        let result = pool.clone().publish(sample_event("p2"), cancel).await;
        assert!(result.is_err());
        assert!(pool.published_events().is_empty());
    }
}
