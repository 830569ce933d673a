//! In-process event bus for orchestrator lifecycle events.
//!
//! Subscribers hand in a channel sender and get a token back; there are no
//! stored closures. A closed receiver is dropped from the table on the next publish.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

pub const WILDCARD: &str = "*";

pub const JOB_QUEUED: &str = "job.queued";
pub const JOB_STARTED: &str = "job.started";
pub const JOB_COMPLETED: &str = "job.completed";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_CANCELLED: &str = "job.cancelled";
pub const ROBOT_ONLINE: &str = "robot.online";
pub const ROBOT_OFFLINE: &str = "robot.offline";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            node_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

#[derive(Default)]
struct Subscriptions {
    next_token: u64,
    by_type: HashMap<String, Vec<(SubscriptionToken, UnboundedSender<BusEvent>)>>,
}

#[derive(Default)]
pub struct EventBus {
    subs: Mutex<Subscriptions>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        sender: UnboundedSender<BusEvent>,
    ) -> SubscriptionToken {
        let mut subs = self.lock();
        subs.next_token += 1;
        let token = SubscriptionToken(subs.next_token);
        subs.by_type
            .entry(event_type.into())
            .or_default()
            .push((token, sender));
        token
    }

    /// Returns false when the token was unknown or already removed.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut subs = self.lock();
        let mut removed = false;
        for list in subs.by_type.values_mut() {
            let before = list.len();
            list.retain(|(t, _)| *t != token);
            removed |= list.len() != before;
        }
        subs.by_type.retain(|_, list| !list.is_empty());
        removed
    }

    /// Delivers to exact-type and wildcard subscribers; returns the delivery count.
    pub fn publish(&self, event: BusEvent) -> usize {
        let mut subs = self.lock();
        let mut delivered = 0;
        for key in [event.event_type.as_str(), WILDCARD] {
            if let Some(list) = subs.by_type.get_mut(key) {
                list.retain(|(_, tx)| {
                    let ok = tx.send(event.clone()).is_ok();
                    delivered += ok as usize;
                    ok
                });
            }
            if event.event_type == WILDCARD {
                break;
            }
        }
        debug!(event_type = %event.event_type, delivered, "Bus event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().by_type.values().map(|l| l.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn exact_and_wildcard_subscribers_both_receive() {
        let bus = EventBus::new();
        let (tx_exact, mut rx_exact) = mpsc::unbounded_channel();
        let (tx_all, mut rx_all) = mpsc::unbounded_channel();
        bus.subscribe(JOB_COMPLETED, tx_exact);
        bus.subscribe(WILDCARD, tx_all);

        assert_eq!(bus.publish(BusEvent::new(JOB_COMPLETED, Map::new())), 2);
        assert_eq!(bus.publish(BusEvent::new(ROBOT_ONLINE, Map::new())), 1);

        assert_eq!(rx_exact.try_recv().unwrap().event_type, JOB_COMPLETED);
        assert!(rx_exact.try_recv().is_err());
        assert_eq!(rx_all.try_recv().unwrap().event_type, JOB_COMPLETED);
        assert_eq!(rx_all.try_recv().unwrap().event_type, ROBOT_ONLINE);
    }

    #[test]
    fn unsubscribe_by_token_stops_delivery() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = bus.subscribe(JOB_FAILED, tx);
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        assert_eq!(bus.publish(BusEvent::new(JOB_FAILED, Map::new())), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn closed_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(JOB_QUEUED, tx);
        drop(rx);
        assert_eq!(bus.publish(BusEvent::new(JOB_QUEUED, Map::new())), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
