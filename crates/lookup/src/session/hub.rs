//! Per-contact fan-out of inbound events
//!
//! Events for a contact with no live subscriber are dropped: a cycle must
//! subscribe before it sends, and nothing is buffered on its behalf.

use super::InboundEvent;
use crate::errors::GatewayError;
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type EventItem = Result<InboundEvent, GatewayError>;

type Registry = HashMap<String, Vec<(u64, mpsc::Sender<EventItem>)>>;

struct HubInner {
    subscribers: Mutex<Registry>,
    next_id: AtomicU64,
    capacity: usize,
}

impl HubInner {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Contact handles compare case-insensitively, with or without `@`
pub fn contact_key(contact: &str) -> String {
    contact.trim().trim_start_matches('@').to_lowercase()
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Open a subscription for one contact. It unregisters when dropped.
    pub fn subscribe(&self, contact: &str) -> EventSubscription {
        let key = contact_key(contact);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        self.inner.registry().entry(key.clone()).or_default().push((id, tx));
        debug!(contact = %key, subscription = id, "Event subscription opened");

        EventSubscription {
            hub: Arc::clone(&self.inner),
            contact: key,
            id,
            rx,
        }
    }

    /// Deliver an event to every live subscriber of `contact`.
    /// Returns how many subscribers received it.
    pub fn publish(&self, contact: &str, event: InboundEvent) -> usize {
        let key = contact_key(contact);
        let mut registry = self.inner.registry();
        let Some(subs) = registry.get_mut(&key) else {
            debug!(contact = %key, kind = event.kind(), "Dropping event with no subscriber");
            return 0;
        };

        let mut delivered = 0;
        subs.retain(|(id, tx)| match tx.try_send(Ok(event.clone())) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(contact = %key, subscription = id, "Subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subs.is_empty() {
            registry.remove(&key);
        }
        delivered
    }

    /// Push a transport failure to every subscriber, e.g. when the update
    /// loop loses the session.
    pub fn fail_all(&self, error: GatewayError) {
        let registry = self.inner.registry();
        for (_, tx) in registry.values().flatten() {
            let _ = tx.try_send(Err(error.clone()));
        }
    }

    /// Push a failure to the subscribers of one contact only
    pub fn fail_contact(&self, contact: &str, error: GatewayError) {
        let key = contact_key(contact);
        if let Some(subs) = self.inner.registry().get(&key) {
            for (_, tx) in subs {
                let _ = tx.try_send(Err(error.clone()));
            }
        }
    }

    pub fn subscriber_count(&self, contact: &str) -> usize {
        self.inner
            .registry()
            .get(&contact_key(contact))
            .map_or(0, Vec::len)
    }
}

/// One cycle's view of a contact's inbound events, in arrival order
pub struct EventSubscription {
    hub: Arc<HubInner>,
    contact: String,
    id: u64,
    rx: mpsc::Receiver<EventItem>,
}

impl EventSubscription {
    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub async fn recv(&mut self) -> Option<EventItem> {
        self.rx.recv().await
    }
}

impl Stream for EventSubscription {
    type Item = EventItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        let mut registry = self.hub.registry();
        if let Some(subs) = registry.get_mut(&self.contact) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                registry.remove(&self.contact);
            }
        }
        debug!(contact = %self.contact, subscription = self.id, "Event subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> InboundEvent {
        InboundEvent::Text {
            message_id: 1,
            text: s.to_string(),
            buttons: vec![],
        }
    }

    #[tokio::test]
    async fn test_no_buffering_before_subscribe() {
        let hub = EventHub::new(8);
        assert_eq!(hub.publish("@bot", text("early")), 0);

        let mut sub = hub.subscribe("@Bot");
        assert_eq!(hub.publish("bot", text("late")), 1);

        match sub.recv().await {
            Some(Ok(InboundEvent::Text { text, .. })) => assert_eq!(text, "late"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let hub = EventHub::new(8);
        let sub = hub.subscribe("bot");
        assert_eq!(hub.subscriber_count("bot"), 1);
        drop(sub);
        assert_eq!(hub.subscriber_count("bot"), 0);
        assert_eq!(hub.publish("bot", text("x")), 0);
    }

    #[tokio::test]
    async fn test_contacts_are_isolated() {
        let hub = EventHub::new(8);
        let mut a = hub.subscribe("alpha");
        let _b = hub.subscribe("beta");

        hub.publish("beta", text("for beta"));
        hub.publish("alpha", text("for alpha"));

        match a.recv().await {
            Some(Ok(InboundEvent::Text { text, .. })) => assert_eq!(text, "for alpha"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_contact_leaves_others_alone() {
        let hub = EventHub::new(8);
        let mut alpha = hub.subscribe("alpha");
        let mut beta = hub.subscribe("beta");

        hub.fail_contact("@Alpha", GatewayError::Protocol("bad file".into()));
        hub.publish("beta", text("ok"));

        assert_eq!(alpha.recv().await, Some(Err(GatewayError::Protocol("bad file".into()))));
        match beta.recv().await {
            Some(Ok(InboundEvent::Text { text, .. })) => assert_eq!(text, "ok"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_all() {
        let hub = EventHub::new(8);
        let mut sub = hub.subscribe("bot");
        hub.fail_all(GatewayError::Closed);
        assert_eq!(sub.recv().await, Some(Err(GatewayError::Closed)));
    }
}
