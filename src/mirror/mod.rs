//! Downstream mirror client. Local storage is authoritative; every call
//! here is best-effort and the ingest loop only logs failures.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::debug;

use crate::db::models::{EquipmentFault, SensorReading};

#[derive(Debug, Clone)]
pub struct MirrorClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    base_url: String,
    api_key: String,
}

impl MirrorClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: Client::new(),
                base_url,
                api_key,
            }),
        }
    }

    /// `upsert(record)` for a persisted reading: `POST {base}/readings`.
    pub async fn upsert_reading(&self, reading: &SensorReading) -> Result<()> {
        self.upsert("readings", reading.id, reading).await
    }

    /// `upsert(record)` for a persisted fault: `POST {base}/faults`.
    pub async fn upsert_fault(&self, fault: &EquipmentFault) -> Result<()> {
        self.upsert("faults", fault.id, fault).await
    }

    async fn upsert<T: serde::Serialize>(&self, table: &str, id: i64, record: &T) -> Result<()> {
        let url = format!("{}/{table}", self.inner.base_url);
        debug!(url = %url, id, "Mirroring record");

        self.inner
            .http
            .post(&url)
            .bearer_auth(&self.inner.api_key)
            .json(record)
            .send()
            .await
            .with_context(|| format!("mirror request to {table} failed"))?
            .error_for_status()
            .with_context(|| format!("mirror rejected {table} record {id}"))?;

        Ok(())
    }
}
