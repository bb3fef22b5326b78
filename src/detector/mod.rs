mod service;

pub use service::{FaultDetector, DETECTOR_QUEUE};
