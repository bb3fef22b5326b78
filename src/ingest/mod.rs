mod service;

pub use service::{IngestService, FAULT_QUEUE, SENSOR_QUEUE};
