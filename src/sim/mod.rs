//! Simulated room sensors. One task per sensor class publishes a reading to
//! the telemetry topic on a fixed interval, for a random room each tick.
//! Each class degrades exactly one randomly chosen tick per minute so the
//! detector always has something to find.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::db::models::SensorType;
use crate::messages::{telemetry_routing_key, TelemetryPayload, TELEMETRY_EXCHANGE};

pub struct Simulator {
    broker: Broker,
    sensor_type: SensorType,
    floors: i64,
    rooms_per_floor: i64,
    interval: Duration,
}

impl Simulator {
    pub fn new(
        broker: Broker,
        sensor_type: SensorType,
        floors: i64,
        rooms_per_floor: i64,
        interval: Duration,
    ) -> Self {
        Self {
            broker,
            sensor_type,
            floors,
            rooms_per_floor,
            interval,
        }
    }

    /// Publishes until the broker closes. Spawn via `tokio::spawn`.
    pub async fn run(self) {
        let mut rng = StdRng::from_entropy();
        let slots_per_minute = (60 / self.interval.as_secs().max(1)).max(1) as i64;
        let mut ticker = time::interval(self.interval);

        let mut current_minute: Option<i64> = None;
        let mut faulty_slot: i64 = 0;
        let mut send_count: i64 = 0;

        info!(
            sensor_type = %self.sensor_type,
            interval_secs = self.interval.as_secs(),
            "Telemetry simulator started"
        );

        loop {
            ticker.tick().await;

            let timestamp = chrono::Utc::now().timestamp();
            let minute = timestamp / 60;
            if current_minute != Some(minute) {
                current_minute = Some(minute);
                faulty_slot = rng.gen_range(0..slots_per_minute);
                send_count = 0;
                debug!(sensor_type = %self.sensor_type, minute, faulty_slot, "New minute");
            }

            let floor = rng.gen_range(1..=self.floors);
            let room = rng.gen_range(1..=self.rooms_per_floor);
            let faulty = send_count == faulty_slot;
            let payload = self.generate(&mut rng, timestamp, faulty);
            let routing_key = telemetry_routing_key(floor, room, self.sensor_type);

            match self.broker.publish(TELEMETRY_EXCHANGE, &routing_key, &payload) {
                Ok(()) => debug!(routing_key = %routing_key, faulty, "Published telemetry"),
                Err(BrokerError::Disconnected) => {
                    info!(sensor_type = %self.sensor_type, "Simulator stopped: broker closed");
                    return;
                }
                Err(e) => warn!(routing_key = %routing_key, error = %e, "Failed to publish telemetry"),
            }

            send_count += 1;
        }
    }

    fn generate(&self, rng: &mut StdRng, timestamp: i64, faulty: bool) -> TelemetryPayload {
        let mut payload = TelemetryPayload {
            timestamp,
            temperature: None,
            humidity: None,
            co2: None,
            power_kw: None,
            presence: None,
        };

        match self.sensor_type {
            SensorType::Iaq => {
                let (temperature, humidity, co2) = if !faulty {
                    (
                        round1(rng.gen_range(24.5..33.0)),
                        round1(rng.gen_range(41.1..51.5)),
                        round1(rng.gen_range(464.0..689.5)),
                    )
                } else if rng.gen_bool(0.5) {
                    // Dead sensor.
                    (0.0, 0.0, 0.0)
                } else {
                    // Partial zeros or out-of-range values.
                    let temperature = if rng.gen_bool(0.3) {
                        0.0
                    } else {
                        round1(rng.gen_range(40.0..60.0))
                    };
                    let humidity = if rng.gen_bool(0.3) {
                        0.0
                    } else {
                        round1(rng.gen_range(80.0..100.0))
                    };
                    let co2 = if rng.gen_bool(0.3) {
                        0.0
                    } else {
                        round1(rng.gen_range(0.0..1000.0))
                    };
                    (temperature, humidity, co2)
                };
                payload.temperature = Some(temperature);
                payload.humidity = Some(humidity);
                payload.co2 = Some(co2);
            }
            SensorType::Power => {
                let power_kw = if !faulty {
                    round1(rng.gen_range(5.0..40.0))
                } else if rng.gen_bool(0.5) {
                    0.0
                } else {
                    round1(rng.gen_range(46.0..60.0))
                };
                payload.power_kw = Some(power_kw);
            }
            SensorType::Presence => {
                payload.presence = Some(if faulty { 3 } else { rng.gen_range(0..=2) });
            }
        }
        payload
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
