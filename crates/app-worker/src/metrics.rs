//! One-shot metrics published on an interval.
//!
//! Each flush publishes the points recorded since the previous flush and
//! then forgets every series, so a metric only appears in the interval it
//! was recorded in.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use message_bus::{BusError, Datapoint, MetricMessage, Publisher};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How downstream consumers combine the points of one series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Aggregator {
    Sum,
    Avg,
    Min,
    #[default]
    Max,
    Last,
}

impl Aggregator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregator::Sum => "sum",
            Aggregator::Avg => "avg",
            Aggregator::Min => "min",
            Aggregator::Max => "max",
            Aggregator::Last => "last",
        }
    }
}

#[derive(Debug)]
struct Series {
    aggregator: Aggregator,
    points: Vec<(i64, f64)>,
}

/// Collects named series and publishes them on the metrics routing key.
pub struct MetricManager {
    prefix: String,
    publisher: Publisher,
    series: Mutex<BTreeMap<String, Series>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricManager {
    /// Create a manager; every series name is prefixed with `prefix`.
    pub fn new(prefix: impl Into<String>, publisher: Publisher) -> Self {
        Self {
            prefix: prefix.into(),
            publisher,
            series: Mutex::new(BTreeMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn series(&self) -> MutexGuard<'_, BTreeMap<String, Series>> {
        self.series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a value, registering the series on first use.
    ///
    /// A series keeps the aggregator it was registered with.
    pub fn record(&self, name: &str, value: f64, aggregator: Aggregator) {
        let full_name = format!("{}{}", self.prefix, name);
        let mut series = self.series();
        let entry = series.entry(full_name).or_insert_with(|| Series {
            aggregator,
            points: Vec::new(),
        });
        if entry.aggregator != aggregator {
            debug!(name, registered = entry.aggregator.as_str(), "Metric already registered");
        }
        entry.points.push((Utc::now().timestamp(), value));
    }

    /// Number of series with points waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.series().len()
    }

    /// Publish everything recorded so far and clear it.
    ///
    /// Returns the number of datapoints published.
    pub fn flush(&self) -> Result<usize, BusError> {
        let drained = std::mem::take(&mut *self.series());
        let message = MetricMessage {
            datapoints: drained
                .into_iter()
                .map(|(name, series)| Datapoint {
                    name,
                    aggregators: vec![series.aggregator.as_str().to_string()],
                    points: series.points,
                })
                .collect(),
        };
        if message.is_empty() {
            return Ok(0);
        }
        let count = message.datapoints.len();
        self.publisher.publish(&message)?;
        debug!(count, "Published metrics");
        Ok(count)
    }

    /// Start flushing every `interval`. Does nothing if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut task = self.task();
        if task.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.flush() {
                    error!("Failed to publish metrics: {}", e);
                }
            }
        }));
    }

    pub fn is_running(&self) -> bool {
        self.task().is_some()
    }

    /// Stop the flush task and publish whatever is left. Idempotent.
    pub fn stop(&self) {
        let Some(task) = self.task().take() else {
            return;
        };
        task.abort();
        if let Err(e) = self.flush() {
            warn!("Failed to publish final metrics: {}", e);
        }
    }
}

impl Drop for MetricManager {
    fn drop(&mut self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
    }
}
