//! Wire format shared by every component on the broker: the two topic
//! spaces, routing-key parsing, and the JSON payload shapes.
//!
//! Parsing is pure and returns typed errors; consume loops decide what a
//! failure means for the message (always: log, ack, move on).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::SensorType;
use crate::rules::SensorValues;

/// Topic exchange carrying raw telemetry, keyed `<floor>.<room>.<sensorType>`.
pub const TELEMETRY_EXCHANGE: &str = "hotel_sensors";
/// Topic exchange carrying detected faults, keyed `<floor>.<room>.fault`.
pub const FAULT_EXCHANGE: &str = "fault_notifications";

const FAULT_SEGMENT: &str = "fault";

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("malformed routing key {0:?}")]
    MalformedRoutingKey(String),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field {0:?}")]
    MissingField(&'static str),
    #[error("presence value out of range: {0}")]
    PresenceOutOfRange(i64),
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
}

pub fn telemetry_routing_key(floor: i64, room: i64, sensor_type: SensorType) -> String {
    format!("{floor}.{room}.{sensor_type}")
}

pub fn fault_routing_key(floor: i64, room: i64) -> String {
    format!("{floor}.{room}.{FAULT_SEGMENT}")
}

/// Origin of a telemetry message, recovered from its routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryKey {
    pub floor: i64,
    pub room: i64,
    pub sensor_type: SensorType,
}

impl TelemetryKey {
    /// Parse `<floor>.<room>.<sensorType>`. Wrong segment count, a
    /// non-positive or non-numeric floor/room, or an unknown sensor type all
    /// reject the key.
    pub fn parse(key: &str) -> Result<Self, MessageError> {
        let (floor, room, kind) = split_key(key)?;
        let sensor_type = kind
            .parse::<SensorType>()
            .map_err(|_| MessageError::MalformedRoutingKey(key.to_owned()))?;
        Ok(Self {
            floor,
            room,
            sensor_type,
        })
    }
}

/// Origin of a fault notification, recovered from its routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultKey {
    pub floor: i64,
    pub room: i64,
}

impl FaultKey {
    /// Parse `<floor>.<room>.fault`.
    pub fn parse(key: &str) -> Result<Self, MessageError> {
        let (floor, room, kind) = split_key(key)?;
        if kind != FAULT_SEGMENT {
            return Err(MessageError::MalformedRoutingKey(key.to_owned()));
        }
        Ok(Self { floor, room })
    }
}

fn split_key(key: &str) -> Result<(i64, i64, &str), MessageError> {
    let malformed = || MessageError::MalformedRoutingKey(key.to_owned());

    let mut segments = key.split('.');
    let (floor, room, kind) = match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some(f), Some(r), Some(k), None) => (f, r, k),
        _ => return Err(malformed()),
    };

    let floor: i64 = floor.parse().map_err(|_| malformed())?;
    let room: i64 = room.parse().map_err(|_| malformed())?;
    if floor < 1 || room < 1 {
        return Err(malformed());
    }
    Ok((floor, room, kind))
}

/// Telemetry message body. `timestamp` is the sensor's declared clock in
/// Unix seconds; exactly the fields for one sensor class are expected to be
/// present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_kw: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<i64>,
}

impl TelemetryPayload {
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Declared observation time, normalized to UTC.
    pub fn observed_at(&self) -> Result<DateTime<Utc>, MessageError> {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .ok_or(MessageError::TimestampOutOfRange(self.timestamp))
    }

    /// Extract and validate the fields the given sensor class requires.
    pub fn values_for(&self, sensor_type: SensorType) -> Result<SensorValues, MessageError> {
        match sensor_type {
            SensorType::Iaq => Ok(SensorValues::Iaq {
                temperature: self
                    .temperature
                    .ok_or(MessageError::MissingField("temperature"))?,
                humidity: self.humidity.ok_or(MessageError::MissingField("humidity"))?,
                co2: self.co2.ok_or(MessageError::MissingField("co2"))?,
            }),
            SensorType::Power => Ok(SensorValues::Power {
                power_kw: self.power_kw.ok_or(MessageError::MissingField("power_kw"))?,
            }),
            SensorType::Presence => {
                let presence = self.presence.ok_or(MessageError::MissingField("presence"))?;
                if !(0..=3).contains(&presence) {
                    return Err(MessageError::PresenceOutOfRange(presence));
                }
                Ok(SensorValues::Presence { presence })
            }
        }
    }
}

/// Fault notification body published by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultPayload {
    pub timestamp: i64,
    pub fault_flags: u32,
}

impl FaultPayload {
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn occurred_at(&self) -> Result<DateTime<Utc>, MessageError> {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .ok_or(MessageError::TimestampOutOfRange(self.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_key_parses_numeric_segments() {
        let key = TelemetryKey::parse("2.3.iaq").unwrap();
        assert_eq!(key.floor, 2);
        assert_eq!(key.room, 3);
        assert_eq!(key.sensor_type, SensorType::Iaq);
    }

    #[test]
    fn telemetry_key_rejects_bad_shapes() {
        for bad in ["bad.key", "1.2.3.4", "x.2.iaq", "1.y.power", "1.2.fridge", "", "0.1.iaq"] {
            assert!(
                matches!(
                    TelemetryKey::parse(bad),
                    Err(MessageError::MalformedRoutingKey(_))
                ),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn fault_key_requires_fault_segment() {
        let key = FaultKey::parse("2.3.fault").unwrap();
        assert_eq!((key.floor, key.room), (2, 3));
        assert!(FaultKey::parse("2.3.iaq").is_err());
    }

    #[test]
    fn routing_key_builders_roundtrip_through_parsers() {
        let key = telemetry_routing_key(1, 5, SensorType::Power);
        assert_eq!(key, "1.5.power");
        assert!(TelemetryKey::parse(&key).is_ok());

        let key = fault_routing_key(3, 1);
        assert_eq!(key, "3.1.fault");
        assert!(FaultKey::parse(&key).is_ok());
    }

    #[test]
    fn telemetry_payload_requires_timestamp() {
        let err = TelemetryPayload::parse(br#"{"temperature": 25.0}"#).unwrap_err();
        assert!(matches!(err, MessageError::Json(_)));
    }

    #[test]
    fn telemetry_payload_rejects_garbage() {
        assert!(TelemetryPayload::parse(b"not json").is_err());
    }

    #[test]
    fn values_for_requires_type_specific_fields() {
        let payload =
            TelemetryPayload::parse(br#"{"timestamp": 1700000000, "power_kw": 12.5}"#).unwrap();

        assert!(matches!(
            payload.values_for(SensorType::Power),
            Ok(SensorValues::Power { power_kw }) if power_kw == 12.5
        ));
        assert!(matches!(
            payload.values_for(SensorType::Iaq),
            Err(MessageError::MissingField("temperature"))
        ));
        assert!(matches!(
            payload.values_for(SensorType::Presence),
            Err(MessageError::MissingField("presence"))
        ));
    }

    #[test]
    fn presence_out_of_range_is_rejected() {
        let payload =
            TelemetryPayload::parse(br#"{"timestamp": 1700000000, "presence": 4}"#).unwrap();
        assert!(matches!(
            payload.values_for(SensorType::Presence),
            Err(MessageError::PresenceOutOfRange(4))
        ));
    }

    #[test]
    fn fault_payload_roundtrip() {
        let body = serde_json::to_vec(&FaultPayload {
            timestamp: 1_700_000_000,
            fault_flags: 2,
        })
        .unwrap();
        let parsed = FaultPayload::parse(&body).unwrap();
        assert_eq!(parsed.fault_flags, 2);
        assert_eq!(parsed.occurred_at().unwrap().timestamp(), 1_700_000_000);
    }
}
