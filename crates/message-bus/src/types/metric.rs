//! Metric datapoints published by workers.

use serde::{Deserialize, Serialize};

/// A single named series with the values collected since the last flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    /// Fully-qualified metric name.
    pub name: String,
    /// Aggregators to apply downstream (`max`, `sum`, ...).
    pub aggregators: Vec<String>,
    /// `(unix_timestamp, value)` pairs.
    pub points: Vec<(i64, f64)>,
}

/// A batch of datapoints published on the metrics routing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricMessage {
    pub datapoints: Vec<Datapoint>,
}

impl MetricMessage {
    /// Whether the message carries any datapoints.
    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }
}
