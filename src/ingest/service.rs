use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Delivery, Subscription};
use crate::db::models::{
    derive_fault_id, derive_reading_id, derive_sensor_id, EquipmentFault, SensorReading,
    SensorType,
};
use crate::messages::{
    FaultKey, FaultPayload, MessageError, TelemetryKey, TelemetryPayload, FAULT_EXCHANGE,
    TELEMETRY_EXCHANGE,
};
use crate::mirror::MirrorClient;
use crate::rules;
use crate::supervisor::{self, RetryPolicy};

pub const SENSOR_QUEUE: &str = "sensor_queue";
pub const FAULT_QUEUE: &str = "fault_queue";

#[derive(Debug, Error)]
enum IngestError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Subscribes to both topics, normalizes payloads into canonical rows,
/// dedup-upserts them into local storage, and forwards persisted rows to the
/// downstream mirror. The DB uniqueness constraints are the only concurrency
/// control; a duplicate-key insert means another writer got there first.
pub struct IngestService {
    broker: Broker,
    pool: SqlitePool,
    mirror: Option<MirrorClient>,
}

impl IngestService {
    pub fn new(broker: Broker, pool: SqlitePool, mirror: Option<MirrorClient>) -> Self {
        Self {
            broker,
            pool,
            mirror,
        }
    }

    /// Declare the exchanges and both durable queues. Idempotent.
    pub fn declare_topology(&self) -> Result<(), BrokerError> {
        self.broker.declare_exchange(TELEMETRY_EXCHANGE);
        self.broker.declare_exchange(FAULT_EXCHANGE);
        self.broker.declare_queue(SENSOR_QUEUE);
        self.broker.declare_queue(FAULT_QUEUE);
        self.broker.bind(TELEMETRY_EXCHANGE, SENSOR_QUEUE, "*.*.*")?;
        self.broker.bind(FAULT_EXCHANGE, FAULT_QUEUE, "*.*.fault")
    }

    /// Consume until the broker shuts down; `Err` means the subscriptions
    /// could not be (re-)established and the process should die.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut policy = RetryPolicy::bootstrap();
        loop {
            let (sensors, faults) = supervisor::retry(policy, "ingest subscribe", || async {
                let sensors = self.broker.subscribe(SENSOR_QUEUE)?;
                let faults = self.broker.subscribe(FAULT_QUEUE)?;
                Ok::<_, BrokerError>((sensors, faults))
            })
            .await?;
            info!(
                sensor_queue = SENSOR_QUEUE,
                fault_queue = FAULT_QUEUE,
                "Ingestion consumer ready"
            );

            let err = self.consume(&sensors, &faults).await;
            if self.broker.is_closed() {
                info!("Ingestion consumer stopped: broker closed");
                return Ok(());
            }
            warn!(error = %err, "Ingest subscriptions lost, reconnecting");
            policy = RetryPolicy::steady();
        }
    }

    /// One message at a time across both queues; ack only after the persist
    /// attempt has completed.
    async fn consume(&self, sensors: &Subscription, faults: &Subscription) -> BrokerError {
        loop {
            tokio::select! {
                delivery = sensors.recv() => match delivery {
                    Ok(d) => {
                        self.handle_telemetry(&d).await;
                        sensors.ack(&d);
                    }
                    Err(e) => return e,
                },
                delivery = faults.recv() => match delivery {
                    Ok(d) => {
                        self.handle_fault(&d).await;
                        faults.ack(&d);
                    }
                    Err(e) => return e,
                },
            }
        }
    }

    async fn handle_telemetry(&self, delivery: &Delivery) {
        match self.persist_telemetry(delivery).await {
            Ok(Some(reading)) => self.forward_reading(&reading).await,
            Ok(None) => {}
            Err(IngestError::Message(e)) => warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Discarding malformed telemetry message"
            ),
            Err(IngestError::Db(e)) => error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to persist reading"
            ),
        }
    }

    async fn handle_fault(&self, delivery: &Delivery) {
        match self.persist_faults(delivery).await {
            Ok(persisted) => {
                for fault in &persisted {
                    self.forward_fault(fault).await;
                }
            }
            Err(IngestError::Message(e)) => warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Discarding malformed fault notification"
            ),
            Err(IngestError::Db(e)) => error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to persist fault"
            ),
        }
    }

    /// Upsert one telemetry message: a second message for the same
    /// `(observed_at, sensor_id)` updates the value fields in place. Returns
    /// the canonical row, or `None` when a surrogate-id collision left an
    /// unrelated row in place.
    async fn persist_telemetry(
        &self,
        delivery: &Delivery,
    ) -> Result<Option<SensorReading>, IngestError> {
        let key = TelemetryKey::parse(&delivery.routing_key)?;
        let payload = TelemetryPayload::parse(&delivery.body)?;
        let observed_at = payload.observed_at()?;

        // Only the fields owned by this sensor class are stored; the rest
        // stay NULL.
        let (temperature, humidity, co2) = match key.sensor_type {
            SensorType::Iaq => (payload.temperature, payload.humidity, payload.co2),
            _ => (None, None, None),
        };
        let power = match key.sensor_type {
            SensorType::Power => payload.power_kw,
            _ => None,
        };
        let presence = match key.sensor_type {
            SensorType::Presence => payload.presence,
            _ => None,
        };
        if let Some(p) = presence {
            if !(0..=3).contains(&p) {
                return Err(MessageError::PresenceOutOfRange(p).into());
            }
        }

        let sensor_id = derive_sensor_id(key.floor, key.room, key.sensor_type);
        let id = derive_reading_id(observed_at, sensor_id);

        let result = sqlx::query(
            r#"
            INSERT INTO sensor_readings
                (id, observed_at, sensor_id, floor, room, sensor_type,
                 temperature, humidity, co2, power, presence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (observed_at, sensor_id) DO UPDATE SET
                temperature = excluded.temperature,
                humidity    = excluded.humidity,
                co2         = excluded.co2,
                power       = excluded.power,
                presence    = excluded.presence
            "#,
        )
        .bind(id)
        .bind(observed_at)
        .bind(sensor_id)
        .bind(key.floor)
        .bind(key.room)
        .bind(key.sensor_type)
        .bind(temperature)
        .bind(humidity)
        .bind(co2)
        .bind(power)
        .bind(presence)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            // The natural-key conflict is absorbed by DO UPDATE, so a unique
            // violation here is a surrogate-id collision with a different
            // logical event. The existing row wins.
            Err(e) if is_unique_violation(&e) => {
                debug!(id, sensor_id, "Reading id collision, keeping existing row");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            floor = key.floor,
            room = key.room,
            sensor_type = %key.sensor_type,
            sensor_id,
            "Stored sensor reading"
        );

        let row = sqlx::query_as::<_, SensorReading>(
            r#"
            SELECT id, observed_at, sensor_id, floor, room, sensor_type,
                   temperature, humidity, co2, power, presence
            FROM sensor_readings
            WHERE observed_at = ?1 AND sensor_id = ?2
            "#,
        )
        .bind(observed_at)
        .bind(sensor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(row))
    }

    /// Split an incoming mask by device-owned bit range and insert one fault
    /// row per nonempty submask, first write wins. Returns the rows this
    /// call actually created.
    async fn persist_faults(
        &self,
        delivery: &Delivery,
    ) -> Result<Vec<EquipmentFault>, IngestError> {
        let key = FaultKey::parse(&delivery.routing_key)?;
        let payload = FaultPayload::parse(&delivery.body)?;
        let occurred_at = payload.occurred_at()?;

        let mut persisted = Vec::new();
        for (device_type, mask) in rules::split_by_device(payload.fault_flags) {
            let severity = rules::severity(mask);
            let id = derive_fault_id(occurred_at, key.floor, key.room, device_type);

            let result = sqlx::query(
                r#"
                INSERT INTO equipment_faults
                    (id, occurred_at, floor, room, device_type,
                     fault_flags, severity, resolved)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                ON CONFLICT (occurred_at, floor, room, device_type) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(occurred_at)
            .bind(key.floor)
            .bind(key.room)
            .bind(device_type)
            .bind(mask as i64)
            .bind(severity)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() == 0 => {
                    info!(
                        floor = key.floor,
                        room = key.room,
                        device_type = %device_type,
                        "Fault already recorded for this instant, keeping first write"
                    );
                }
                Ok(_) => {
                    info!(
                        floor = key.floor,
                        room = key.room,
                        device_type = %device_type,
                        fault_flags = mask,
                        severity,
                        "Recorded fault"
                    );
                    let row = sqlx::query_as::<_, EquipmentFault>(
                        r#"
                        SELECT id, occurred_at, floor, room, device_type,
                               fault_flags, severity, resolved
                        FROM equipment_faults
                        WHERE occurred_at = ?1 AND floor = ?2 AND room = ?3
                          AND device_type = ?4
                        "#,
                    )
                    .bind(occurred_at)
                    .bind(key.floor)
                    .bind(key.room)
                    .bind(device_type)
                    .fetch_one(&self.pool)
                    .await?;
                    persisted.push(row);
                }
                Err(e) if is_unique_violation(&e) => {
                    debug!(id, "Fault id collision, keeping existing row");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(persisted)
    }

    async fn forward_reading(&self, reading: &SensorReading) {
        let Some(mirror) = &self.mirror else { return };
        if let Err(e) = mirror.upsert_reading(reading).await {
            warn!(id = reading.id, error = %e, "Mirror forward failed for reading");
        }
    }

    async fn forward_fault(&self, fault: &EquipmentFault) {
        let Some(mirror) = &self.mirror else { return };
        if let Err(e) = mirror.upsert_fault(fault).await {
            warn!(id = fault.id, error = %e, "Mirror forward failed for fault");
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
