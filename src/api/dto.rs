use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{EquipmentFault, SensorReading, SensorType};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SensorReadingDto {
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

impl From<SensorReading> for SensorReadingDto {
    fn from(r: SensorReading) -> Self {
        Self {
            id: r.id,
            observed_at: r.observed_at,
            sensor_id: r.sensor_id,
            floor: r.floor,
            room: r.room,
            sensor_type: r.sensor_type,
            temperature: r.temperature,
            humidity: r.humidity,
            co2: r.co2,
            power: r.power,
            presence: r.presence,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EquipmentFaultDto {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub floor: i64,
    pub room: i64,
    pub device_type: SensorType,
    /// Bitmask restricted to the bit range owned by `device_type`.
    pub fault_flags: i64,
    pub severity: i64,
    pub resolved: bool,
}

impl From<EquipmentFault> for EquipmentFaultDto {
    fn from(f: EquipmentFault) -> Self {
        Self {
            id: f.id,
            occurred_at: f.occurred_at,
            floor: f.floor,
            room: f.room,
            device_type: f.device_type,
            fault_flags: f.fault_flags,
            severity: f.severity,
            resolved: f.resolved,
        }
    }
}
