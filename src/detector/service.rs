use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery, Subscription};
use crate::messages::{
    fault_routing_key, FaultPayload, MessageError, TelemetryKey, TelemetryPayload, FAULT_EXCHANGE,
    TELEMETRY_EXCHANGE,
};
use crate::rules;
use crate::supervisor::{self, RetryPolicy};

pub const DETECTOR_QUEUE: &str = "detector_queue";

/// A fault notification ready to publish, derived from one telemetry
/// message.
#[derive(Debug)]
struct Detected {
    routing_key: String,
    payload: FaultPayload,
    summary: String,
}

/// Subscribes to the telemetry topic, runs the rule engine on every message
/// and republishes detected faults onto the fault-notification topic.
/// Stateless across messages.
pub struct FaultDetector {
    broker: Broker,
}

impl FaultDetector {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Declare the exchanges and the durable detector queue. Idempotent.
    pub fn declare_topology(&self) -> Result<(), BrokerError> {
        self.broker.declare_exchange(TELEMETRY_EXCHANGE);
        self.broker.declare_exchange(FAULT_EXCHANGE);
        self.broker.declare_queue(DETECTOR_QUEUE);
        self.broker.bind(TELEMETRY_EXCHANGE, DETECTOR_QUEUE, "*.*.*")
    }

    /// Consume until the broker shuts down. Returns `Err` only when the
    /// subscription cannot be (re-)established, which the caller treats as
    /// fatal.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut policy = RetryPolicy::bootstrap();
        loop {
            let subscription = supervisor::retry(policy, "detector subscribe", || async {
                self.broker.subscribe(DETECTOR_QUEUE)
            })
            .await?;
            info!(queue = DETECTOR_QUEUE, "Fault detector consuming telemetry");

            let err = self.consume(&subscription).await;
            if self.broker.is_closed() {
                info!("Fault detector stopped: broker closed");
                return Ok(());
            }
            warn!(error = %err, "Telemetry subscription lost, reconnecting");
            policy = RetryPolicy::steady();
        }
    }

    async fn consume(&self, subscription: &Subscription) -> BrokerError {
        loop {
            let delivery = match subscription.recv().await {
                Ok(d) => d,
                Err(e) => return e,
            };
            self.handle(&delivery);
            // Acked regardless of outcome: malformed messages are discarded
            // and publish failures are not retried via redelivery.
            subscription.ack(&delivery);
        }
    }

    fn handle(&self, delivery: &Delivery) {
        match Self::detect(delivery) {
            Ok(Some(detected)) => {
                info!(
                    routing_key = %delivery.routing_key,
                    fault_flags = detected.payload.fault_flags,
                    summary = %detected.summary,
                    "Fault detected"
                );
                if let Err(e) =
                    self.broker
                        .publish(FAULT_EXCHANGE, &detected.routing_key, &detected.payload)
                {
                    error!(
                        routing_key = %detected.routing_key,
                        error = %e,
                        "Failed to publish fault notification"
                    );
                }
            }
            Ok(None) => {
                debug!(routing_key = %delivery.routing_key, "No fault detected");
            }
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %e,
                    "Discarding malformed telemetry message"
                );
            }
        }
    }

    /// Pure per-message step: parse, evaluate, build the notification.
    fn detect(delivery: &Delivery) -> Result<Option<Detected>, MessageError> {
        let key = TelemetryKey::parse(&delivery.routing_key)?;
        let payload = TelemetryPayload::parse(&delivery.body)?;
        let values = payload.values_for(key.sensor_type)?;

        let eval = rules::evaluate(&values);
        if !eval.is_fault() {
            return Ok(None);
        }
        Ok(Some(Detected {
            routing_key: fault_routing_key(key.floor, key.room),
            payload: FaultPayload {
                // The triggering message's declared time, not receipt time.
                timestamp: payload.timestamp,
                fault_flags: eval.fault_flags,
            },
            summary: eval.summary(),
        }))
    }
}
