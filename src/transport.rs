//! Transport abstraction
//!
//! A minimal publish/subscribe interface over hierarchical string topics.
//! Pipeline stages talk only to the `Transport` trait so the in-memory bus can
//! be swapped for a real broker binding without touching detection logic.
//!
//! Delivery is at-most-once and fire-and-forget: publish does not wait for
//! downstream acknowledgment, and a stopped subscriber simply misses messages.

use crate::error::PipelineError;
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::warn;

/// Well-known pipeline topics
pub mod topics {
    /// Raw interaction events from the ingress boundary
    pub const SIGNAL_RAW: &str = "signal.raw";
    /// Normalized behavioral signals from the pattern detector
    pub const SIGNAL_NORMALIZED: &str = "signal.normalized";
    /// Friction snapshots from the session correlator
    pub const SESSION_FRICTION: &str = "session.friction";
    /// One-tap feedback reactions
    pub const FEEDBACK_RECORDED: &str = "feedback.recorded";
    /// Context-enriched raw/feedback events
    pub const CONTEXT_ENRICHED: &str = "context.enriched";
    /// Prompt throttle decisions
    pub const POLICY_UPDATED: &str = "policy.updated";
}

/// Handler invoked once per delivered message
pub type MessageHandler = Box<dyn Fn(serde_json::Value) + Send>;

/// Handle for an active subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub topic: String,
}

/// Publish/subscribe transport over named topics
pub trait Transport: Send + Sync {
    /// Enqueue a JSON payload to all subscribers of `topic`
    fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), PipelineError>;

    /// Register a handler invoked once per message delivered on `topic`.
    ///
    /// Messages for one subscription are processed sequentially in arrival
    /// order; distinct subscriptions process in parallel.
    fn subscribe(&self, topic: &str, handler: MessageHandler)
        -> Result<Subscription, PipelineError>;

    /// Release a subscription; no further messages are delivered to it
    fn unsubscribe(&self, subscription: &Subscription);

    /// Whether the transport can currently accept publishes
    fn is_ready(&self) -> bool;
}

/// Publish a serializable value to a topic
pub fn publish_json<T: serde::Serialize>(
    transport: &dyn Transport,
    topic: &str,
    value: &T,
) -> Result<(), PipelineError> {
    let payload = serde_json::to_value(value)?;
    transport.publish(topic, &payload)
}

struct SubscriberEntry {
    id: u64,
    sender: Sender<serde_json::Value>,
}

/// In-process transport backed by one worker thread per subscription.
///
/// Each subscription owns an unbounded channel drained by a dedicated worker,
/// which preserves per-subscription arrival order while letting different
/// stages run concurrently.
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Close the bus: drop all subscriptions and join worker threads.
    ///
    /// Publishing after shutdown is an error; in-flight messages still queued
    /// on subscription channels are drained before the workers exit.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .clear();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .expect("worker list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Transport for InMemoryBus {
    fn publish(&self, topic: &str, payload: &serde_json::Value) -> Result<(), PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::TransportClosed(topic.to_string()));
        }

        let subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        if let Some(entries) = subscribers.get(topic) {
            for entry in entries {
                // A send failure means the subscriber already went away.
                let _ = entry.sender.send(payload.clone());
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Subscription, PipelineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::TransportClosed(topic.to_string()));
        }

        let (sender, receiver) = unbounded::<serde_json::Value>();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .entry(topic.to_string())
            .or_default()
            .push(SubscriberEntry { id, sender });

        // Worker exits when the last sender for this subscription is dropped.
        let worker = std::thread::spawn(move || {
            for message in receiver.iter() {
                handler(message);
            }
        });
        self.workers
            .lock()
            .expect("worker list poisoned")
            .push(worker);

        Ok(Subscription {
            id,
            topic: topic.to_string(),
        })
    }

    fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.lock().expect("subscriber map poisoned");
        if let Some(entries) = subscribers.get_mut(&subscription.topic) {
            entries.retain(|entry| entry.id != subscription.id);
            if entries.is_empty() {
                subscribers.remove(&subscription.topic);
            }
        }
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Decode a delivered payload, logging and swallowing failures.
///
/// Decoding failures on a subscription are not retried; the message is
/// dropped, matching the at-most-once delivery contract.
pub fn decode_message<T: serde::de::DeserializeOwned>(
    topic: &str,
    payload: serde_json::Value,
) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            warn!(topic, error = %err, "dropping undecodable message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded as channel;
    use std::time::Duration;

    #[test]
    fn test_publish_reaches_subscriber() {
        let bus = InMemoryBus::new();
        let (tx, rx) = channel();

        bus.subscribe(
            "test.topic",
            Box::new(move |msg| {
                tx.send(msg).unwrap();
            }),
        )
        .unwrap();

        bus.publish("test.topic", &serde_json::json!({"n": 1})).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received["n"], 1);
        bus.shutdown();
    }

    #[test]
    fn test_per_subscription_order_preserved() {
        let bus = InMemoryBus::new();
        let (tx, rx) = channel();

        bus.subscribe(
            "test.order",
            Box::new(move |msg| {
                tx.send(msg["n"].as_i64().unwrap()).unwrap();
            }),
        )
        .unwrap();

        for n in 0..50 {
            bus.publish("test.order", &serde_json::json!({ "n": n })).unwrap();
        }

        for expected in 0..50 {
            let got = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(got, expected);
        }
        bus.shutdown();
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let (tx, rx) = channel();

        let sub = bus
            .subscribe(
                "test.unsub",
                Box::new(move |msg| {
                    tx.send(msg).unwrap();
                }),
            )
            .unwrap();

        bus.publish("test.unsub", &serde_json::json!({"n": 1})).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        bus.unsubscribe(&sub);
        bus.publish("test.unsub", &serde_json::json!({"n": 2})).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        bus.shutdown();
    }

    #[test]
    fn test_publish_after_shutdown_errors() {
        let bus = InMemoryBus::new();
        bus.shutdown();

        let result = bus.publish("test.closed", &serde_json::json!({}));
        assert!(matches!(result, Err(PipelineError::TransportClosed(_))));
        assert!(!bus.is_ready());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = InMemoryBus::new();
        bus.publish("test.nobody", &serde_json::json!({"n": 1})).unwrap();
        bus.shutdown();
    }

    #[test]
    fn test_decode_message_swallows_bad_payload() {
        let decoded: Option<crate::types::RawEvent> =
            decode_message("signal.raw", serde_json::json!({"bogus": true}));
        assert!(decoded.is_none());
    }
}
