use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use sqlx::SqlitePool;
use utoipa::OpenApi;

use super::dto::{EquipmentFaultDto, SensorReadingDto};
use super::errors::AppError;
use crate::db::models::{EquipmentFault, SensorReading, SensorType};

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReadingsParams {
    pub floor: Option<i64>,
    pub room: Option<i64>,
    pub sensor_type: Option<SensorType>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Fetch the most recent readings, newest first, optionally filtered by
/// floor, room and sensor type.
#[utoipa::path(
    get,
    path = "/readings",
    params(
        ("floor" = Option<i64>, Query, description = "Filter by floor"),
        ("room" = Option<i64>, Query, description = "Filter by room"),
        ("sensor_type" = Option<SensorType>, Query, description = "Filter by sensor type"),
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 100)"),
    ),
    responses(
        (status = 200, description = "Sensor readings, newest first", body = Vec<SensorReadingDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_readings(
    State(pool): State<SqlitePool>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<SensorReadingDto>>, AppError> {
    let rows = sqlx::query_as::<_, SensorReading>(
        r#"
        SELECT id, observed_at, sensor_id, floor, room, sensor_type,
               temperature, humidity, co2, power, presence
        FROM sensor_readings
        WHERE (?1 IS NULL OR floor = ?1)
          AND (?2 IS NULL OR room = ?2)
          AND (?3 IS NULL OR sensor_type = ?3)
        ORDER BY observed_at DESC
        LIMIT ?4
        "#,
    )
    .bind(params.floor)
    .bind(params.room)
    .bind(params.sensor_type)
    .bind(params.limit.unwrap_or(100))
    .fetch_all(&pool)
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Fetch the most recent unresolved faults across the whole building.
#[utoipa::path(
    get,
    path = "/faults/recent",
    params(
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 10)"),
    ),
    responses(
        (status = 200, description = "Unresolved faults, newest first", body = Vec<EquipmentFaultDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "faults"
)]
pub async fn get_recent_faults(
    State(pool): State<SqlitePool>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<EquipmentFaultDto>>, AppError> {
    let rows = sqlx::query_as::<_, EquipmentFault>(
        r#"
        SELECT id, occurred_at, floor, room, device_type,
               fault_flags, severity, resolved
        FROM equipment_faults
        WHERE resolved = 0
        ORDER BY occurred_at DESC
        LIMIT ?1
        "#,
    )
    .bind(params.limit.unwrap_or(10))
    .fetch_all(&pool)
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Fetch the most recent unresolved faults for one floor.
#[utoipa::path(
    get,
    path = "/faults/floor/{floor}",
    params(
        ("floor" = i64, Path, description = "Floor number"),
        ("limit" = Option<i64>, Query, description = "Maximum rows (default 10)"),
    ),
    responses(
        (status = 200, description = "Unresolved faults for the floor, newest first", body = Vec<EquipmentFaultDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "faults"
)]
pub async fn get_faults_by_floor(
    State(pool): State<SqlitePool>,
    Path(floor): Path<i64>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<EquipmentFaultDto>>, AppError> {
    let rows = sqlx::query_as::<_, EquipmentFault>(
        r#"
        SELECT id, occurred_at, floor, room, device_type,
               fault_flags, severity, resolved
        FROM equipment_faults
        WHERE floor = ?1 AND resolved = 0
        ORDER BY occurred_at DESC
        LIMIT ?2
        "#,
    )
    .bind(floor)
    .bind(params.limit.unwrap_or(10))
    .fetch_all(&pool)
    .await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Mark a fault as resolved — the only mutation the API exposes.
#[utoipa::path(
    post,
    path = "/faults/{id}/resolve",
    params(
        ("id" = i64, Path, description = "Fault id"),
    ),
    responses(
        (status = 200, description = "Updated fault", body = EquipmentFaultDto),
        (status = 404, description = "No fault with that id"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "faults"
)]
pub async fn resolve_fault(
    State(pool): State<SqlitePool>,
    Path(id): Path<i64>,
) -> Result<Json<EquipmentFaultDto>, AppError> {
    sqlx::query("UPDATE equipment_faults SET resolved = 1 WHERE id = ?1")
        .bind(id)
        .execute(&pool)
        .await?;

    let row = sqlx::query_as::<_, EquipmentFault>(
        r#"
        SELECT id, occurred_at, floor, room, device_type,
               fault_flags, severity, resolved
        FROM equipment_faults
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&pool)
    .await?
    .ok_or(AppError::NotFound("fault not found"))?;

    Ok(Json(row.into()))
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(get_readings, get_recent_faults, get_faults_by_floor, resolve_fault, health),
    components(schemas(SensorReadingDto, EquipmentFaultDto, SensorType)),
    tags(
        (name = "readings", description = "Telemetry reading endpoints"),
        (name = "faults", description = "Equipment fault endpoints"),
        (name = "system", description = "System endpoints"),
    ),
    info(
        title = "Hotel Telemetry API",
        version = "0.1.0",
        description = "Query API over ingested telemetry and detected faults"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
