//! In-process topic broker carrying telemetry and fault events between the
//! service loops.
//!
//! Semantics follow the usual topic-exchange model: exchanges route each
//! published message to every bound queue whose pattern matches the routing
//! key (one copy per queue), queues hold messages until a subscriber
//! acknowledges them, and a subscriber that goes away with deliveries still
//! unacknowledged puts them back at the head of the queue marked
//! `redelivered`. Delivery is therefore at-least-once and consumers are
//! expected to be idempotent.

mod topic;

pub use topic::TopicPattern;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown exchange {0:?}")]
    UnknownExchange(String),
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),
    #[error("broker connection closed")]
    Disconnected,
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One message handed to a subscriber. Must be settled with
/// [`Subscription::ack`] once processing has completed.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }
}

struct Exchange {
    bindings: Vec<(TopicPattern, String)>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
    next_tag: u64,
}

struct Shared {
    topology: Mutex<Topology>,
    closed: AtomicBool,
}

/// Cloneable broker handle. Constructed once in `main` and injected into
/// every service; `close` is the shutdown signal for all consume loops.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                topology: Mutex::new(Topology::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Idempotent.
    pub fn declare_exchange(&self, name: &str) {
        let mut topology = self.lock_topology();
        topology
            .exchanges
            .entry(name.to_owned())
            .or_insert_with(|| Exchange {
                bindings: Vec::new(),
            });
    }

    /// Idempotent. Queue contents persist across subscriber churn for the
    /// lifetime of the broker.
    pub fn declare_queue(&self, name: &str) {
        let mut topology = self.lock_topology();
        topology.queues.entry(name.to_owned()).or_insert_with(Queue::new);
    }

    pub fn bind(&self, exchange: &str, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        let mut topology = self.lock_topology();
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_owned()));
        }
        let exchange = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_owned()))?;

        let binding = (TopicPattern::new(pattern), queue.to_owned());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    /// Route `payload` to every queue bound to `exchange` with a matching
    /// pattern. A queue receives one copy even if several of its bindings
    /// match.
    pub fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Disconnected);
        }
        let body = serde_json::to_vec(payload)?;
        self.publish_raw(exchange, routing_key, body)
    }

    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Disconnected);
        }

        let mut topology = self.lock_topology();
        let bindings = &topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::UnknownExchange(exchange.to_owned()))?
            .bindings;

        let mut matched: Vec<String> = Vec::new();
        for (pattern, queue) in bindings {
            if pattern.matches(routing_key) && !matched.contains(queue) {
                matched.push(queue.clone());
            }
        }

        for queue_name in matched {
            topology.next_tag += 1;
            let delivery = Delivery {
                tag: topology.next_tag,
                routing_key: routing_key.to_owned(),
                body: body.clone(),
                redelivered: false,
            };
            if let Some(queue) = topology.queues.get(&queue_name) {
                queue
                    .state
                    .lock()
                    .expect("queue state poisoned")
                    .ready
                    .push_back(delivery);
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    pub fn subscribe(&self, queue: &str) -> Result<Subscription, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Disconnected);
        }
        let topology = self.lock_topology();
        let queue = topology
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;
        Ok(Subscription {
            queue,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Wake every consumer with `Disconnected`. Further publishes and
    /// subscriptions fail.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let topology = self.lock_topology();
        for queue in topology.queues.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn lock_topology(&self) -> std::sync::MutexGuard<'_, Topology> {
        self.shared.topology.lock().expect("broker topology poisoned")
    }
}

/// Exclusive consumer handle on one queue.
pub struct Subscription {
    queue: Arc<Queue>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Await the next delivery. The returned message counts as
    /// unacknowledged until [`ack`](Self::ack) is called; if this
    /// subscription is dropped first, the message is requeued.
    ///
    /// Returns `Disconnected` once the broker has been closed.
    pub async fn recv(&self) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.queue.notify.notified();

            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Disconnected);
            }
            {
                let mut state = self.queue.state.lock().expect("queue state poisoned");
                if let Some(delivery) = state.ready.pop_front() {
                    state.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(delivery);
                }
            }

            notified.await;
        }
    }

    /// Settle a delivery. Unknown tags (already settled) are ignored.
    pub fn ack(&self, delivery: &Delivery) {
        self.queue
            .state
            .lock()
            .expect("queue state poisoned")
            .unacked
            .remove(&delivery.tag);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock().expect("queue state poisoned");
        if state.unacked.is_empty() {
            return;
        }
        // Requeue in tag order at the head, flagged as redeliveries.
        let mut orphans: Vec<Delivery> = state.unacked.drain().map(|(_, d)| d).collect();
        orphans.sort_by_key(|d| d.tag);
        for mut delivery in orphans.into_iter().rev() {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
        }
        drop(state);
        self.queue.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn telemetry_broker() -> Broker {
        let broker = Broker::new();
        broker.declare_exchange("hotel_sensors");
        broker.declare_queue("sensor_queue");
        broker.bind("hotel_sensors", "sensor_queue", "*.*.*").unwrap();
        broker
    }

    #[tokio::test]
    async fn publish_reaches_matching_queue() {
        let broker = telemetry_broker();
        broker
            .publish("hotel_sensors", "2.3.iaq", &serde_json::json!({"timestamp": 1}))
            .unwrap();

        let sub = broker.subscribe("sensor_queue").unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "2.3.iaq");
        assert!(!delivery.redelivered);
        sub.ack(&delivery);
    }

    #[tokio::test]
    async fn non_matching_key_is_not_delivered() {
        let broker = Broker::new();
        broker.declare_exchange("fault_notifications");
        broker.declare_queue("fault_queue");
        broker
            .bind("fault_notifications", "fault_queue", "*.*.fault")
            .unwrap();

        broker
            .publish("fault_notifications", "2.3.iaq", &serde_json::json!({}))
            .unwrap();
        broker
            .publish("fault_notifications", "2.3.fault", &serde_json::json!({}))
            .unwrap();

        let sub = broker.subscribe("fault_queue").unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "2.3.fault");
        sub.ack(&delivery);

        let state = sub.queue.state.lock().unwrap();
        assert!(state.ready.is_empty());
    }

    #[tokio::test]
    async fn overlapping_bindings_deliver_one_copy() {
        let broker = telemetry_broker();
        broker.bind("hotel_sensors", "sensor_queue", "2.#").unwrap();

        broker
            .publish("hotel_sensors", "2.3.power", &serde_json::json!({}))
            .unwrap();

        let sub = broker.subscribe("sensor_queue").unwrap();
        let delivery = sub.recv().await.unwrap();
        sub.ack(&delivery);
        assert!(sub.queue.state.lock().unwrap().ready.is_empty());
    }

    #[tokio::test]
    async fn fanout_to_multiple_queues() {
        let broker = telemetry_broker();
        broker.declare_queue("detector_queue");
        broker
            .bind("hotel_sensors", "detector_queue", "#")
            .unwrap();

        broker
            .publish("hotel_sensors", "1.1.presence", &serde_json::json!({}))
            .unwrap();

        for queue in ["sensor_queue", "detector_queue"] {
            let sub = broker.subscribe(queue).unwrap();
            let delivery = sub.recv().await.unwrap();
            assert_eq!(delivery.routing_key, "1.1.presence");
            sub.ack(&delivery);
        }
    }

    #[tokio::test]
    async fn unacked_deliveries_are_requeued_on_drop() {
        let broker = telemetry_broker();
        broker
            .publish("hotel_sensors", "1.2.iaq", &serde_json::json!({"n": 1}))
            .unwrap();

        {
            let sub = broker.subscribe("sensor_queue").unwrap();
            let _unacked = sub.recv().await.unwrap();
            // Dropped without ack.
        }

        let sub = broker.subscribe("sensor_queue").unwrap();
        let delivery = sub.recv().await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(delivery.routing_key, "1.2.iaq");
        sub.ack(&delivery);
    }

    #[tokio::test]
    async fn acked_deliveries_stay_settled() {
        let broker = telemetry_broker();
        broker
            .publish("hotel_sensors", "1.2.iaq", &serde_json::json!({}))
            .unwrap();

        {
            let sub = broker.subscribe("sensor_queue").unwrap();
            let delivery = sub.recv().await.unwrap();
            sub.ack(&delivery);
        }

        let sub = broker.subscribe("sensor_queue").unwrap();
        let got = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(got.is_err(), "settled message must not be redelivered");
    }

    #[tokio::test]
    async fn publish_to_undeclared_exchange_fails() {
        let broker = Broker::new();
        let err = broker
            .publish("nowhere", "1.1.iaq", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownExchange(_)));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let broker = telemetry_broker();
        let sub = broker.subscribe("sensor_queue").unwrap();

        let closer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, BrokerError::Disconnected));
        assert!(matches!(
            broker.publish("hotel_sensors", "1.1.iaq", &serde_json::json!({})),
            Err(BrokerError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn messages_survive_subscriber_churn() {
        let broker = telemetry_broker();
        broker
            .publish("hotel_sensors", "3.5.power", &serde_json::json!({}))
            .unwrap();

        // No subscriber yet; message waits in the queue.
        let sub = broker.subscribe("sensor_queue").unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "3.5.power");
        sub.ack(&delivery);
    }
}
