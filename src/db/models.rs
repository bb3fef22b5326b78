use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use utoipa::ToSchema;

/// Sensor / device class. Doubles as the `device_type` of a fault row, since
/// the fault bit ranges are partitioned by the same three classes.
///
/// Stored as lowercase TEXT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Iaq,
    Power,
    Presence,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SensorType::Iaq => "iaq",
            SensorType::Power => "power",
            SensorType::Presence => "presence",
        };
        f.write_str(s)
    }
}

impl FromStr for SensorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "iaq" => Ok(Self::Iaq),
            "power" => Ok(Self::Power),
            "presence" => Ok(Self::Presence),
            other => Err(anyhow::anyhow!("unknown sensor type: {other:?}")),
        }
    }
}

/// One observation for one sensor at one instant.
///
/// Fields not applicable to the sensor type are `NULL`. At most one row
/// exists per `(observed_at, sensor_id)` — later messages for the same key
/// update the type-specific fields in place instead of adding rows.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: i64,
    pub observed_at: DateTime<Utc>,
    pub sensor_id: i64,
    pub floor: i64,
    pub room: i64,
    pub sensor_type: SensorType,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub power: Option<f64>,
    pub presence: Option<i64>,
}

/// One detected fault episode for one device class in one room at one
/// instant. Immutable except for `resolved`; at most one row per
/// `(occurred_at, floor, room, device_type)`, first write wins.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EquipmentFault {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub floor: i64,
    pub room: i64,
    pub device_type: SensorType,
    pub fault_flags: i64,
    pub severity: i64,
    pub resolved: bool,
}

/// Deterministic sensor identity for `(floor, room, sensor_type)` — stable
/// across restarts, never supplied by the sensor itself.
pub fn derive_sensor_id(floor: i64, room: i64, sensor_type: SensorType) -> i64 {
    fold_hash(&format!("{floor}:{room}:{sensor_type}")) % 10_000_000_000
}

/// Surrogate primary key for a reading row: content hash of the natural key.
/// The `(observed_at, sensor_id)` unique constraint remains the dedup
/// backstop should two distinct keys ever hash to the same id.
pub fn derive_reading_id(observed_at: DateTime<Utc>, sensor_id: i64) -> i64 {
    fold_hash(&format!("reading:{}:{sensor_id}", observed_at.timestamp()))
}

/// Surrogate primary key for a fault row, hashed from its natural key.
pub fn derive_fault_id(
    occurred_at: DateTime<Utc>,
    floor: i64,
    room: i64,
    device_type: SensorType,
) -> i64 {
    fold_hash(&format!(
        "fault:{}:{floor}:{room}:{device_type}",
        occurred_at.timestamp()
    ))
}

/// Fold a sha256 digest into a positive, non-zero i64.
fn fold_hash(input: &str) -> i64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (i64::from_be_bytes(bytes) & i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn sensor_type_parse_and_display_roundtrip() {
        for st in [SensorType::Iaq, SensorType::Power, SensorType::Presence] {
            assert_eq!(st.to_string().parse::<SensorType>().unwrap(), st);
        }
        assert!("thermostat".parse::<SensorType>().is_err());
    }

    #[test]
    fn sensor_id_is_deterministic_and_distinct_per_key() {
        let a = derive_sensor_id(2, 3, SensorType::Iaq);
        let b = derive_sensor_id(2, 3, SensorType::Iaq);
        assert_eq!(a, b);
        assert!(a > 0);
        assert!(a < 10_000_000_000);

        assert_ne!(a, derive_sensor_id(2, 3, SensorType::Power));
        assert_ne!(a, derive_sensor_id(2, 4, SensorType::Iaq));
        assert_ne!(a, derive_sensor_id(3, 3, SensorType::Iaq));
    }

    #[test]
    fn surrogate_ids_are_stable_for_the_same_natural_key() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let sensor = derive_sensor_id(1, 1, SensorType::Power);

        assert_eq!(derive_reading_id(at, sensor), derive_reading_id(at, sensor));
        assert_eq!(
            derive_fault_id(at, 1, 1, SensorType::Power),
            derive_fault_id(at, 1, 1, SensorType::Power)
        );
        assert_ne!(
            derive_fault_id(at, 1, 1, SensorType::Power),
            derive_fault_id(at, 1, 1, SensorType::Iaq)
        );
    }

    #[test]
    fn surrogate_ids_are_positive() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        for floor in 1..=3 {
            for room in 1..=5 {
                let id = derive_fault_id(at, floor, room, SensorType::Presence);
                assert!(id > 0);
            }
        }
    }
}
