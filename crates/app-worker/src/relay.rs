//! Moves messages between the in-process bus and the durable queues in the
//! shared store, so separate worker processes reach one another.
//!
//! Outgoing, durable messages that no consumer in this process takes
//! arrive on the bus [`Outlet`] and are enqueued in the store. Incoming,
//! the relay polls the store for the queues this process consumes, claims
//! each row under a lease, publishes it on the local bus and acks it. A
//! row is acked once it is on the local queue; handlers deduplicate
//! redelivered messages by id.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use database::{queue, SqlitePool};
use message_bus::{MessageBus, Outlet, RoutingConfig, Unconsumed};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{WorkerConfig, DEFAULT_RELAY_LEASE, DEFAULT_RELAY_POLL_INTERVAL};
use crate::error::{Result, WorkerError};

/// Rows claimed from one queue per poll.
const MAX_PULL_PER_QUEUE: usize = 100;

pub struct QueueRelay {
    pool: SqlitePool,
    bus: MessageBus,
    outlet: Outlet,
    unsent: VecDeque<Unconsumed>,
    pulls: Vec<RoutingConfig>,
    consumer_id: String,
    lease: Duration,
    poll_interval: Duration,
}

impl QueueRelay {
    /// Attach to the bus outlet. Queues to poll are added with
    /// [`pull`](Self::pull).
    pub fn new(pool: SqlitePool, bus: MessageBus, consumer_id: impl Into<String>) -> Result<Self> {
        let outlet = bus.attach_outlet()?;
        Ok(Self {
            pool,
            bus,
            outlet,
            unsent: VecDeque::new(),
            pulls: Vec::new(),
            consumer_id: consumer_id.into(),
            lease: DEFAULT_RELAY_LEASE,
            poll_interval: DEFAULT_RELAY_POLL_INTERVAL,
        })
    }

    /// Relay for a worker process: polls every queue the worker consumes.
    pub fn for_worker(config: &WorkerConfig, pool: SqlitePool, bus: MessageBus) -> Result<Self> {
        let consumer_id = format!("{}-{}", config.worker_name, std::process::id());
        let relay = config
            .consumed_queues()
            .into_iter()
            .fold(Self::new(pool, bus, consumer_id)?, Self::pull);
        Ok(relay
            .with_lease(config.relay_lease)
            .with_poll_interval(config.relay_poll_interval))
    }

    /// Poll `routing`'s queue in the store for this process.
    pub fn pull(mut self, routing: RoutingConfig) -> Self {
        self.pulls.push(routing);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queues(&self) -> &[RoutingConfig] {
        &self.pulls
    }

    /// Enqueue every message waiting on the outlet. Returns how many.
    ///
    /// A message the store refuses stays queued here for the next call.
    pub async fn push_pending(&mut self) -> Result<usize> {
        while let Some(msg) = self.outlet.try_recv() {
            self.unsent.push_back(msg);
        }

        let mut pushed = 0;
        while let Some(msg) = self.unsent.front() {
            queue::enqueue(&self.pool, &msg.exchange, &msg.routing_key, &msg.payload).await?;
            self.unsent.pop_front();
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Claim rows for the local queues and publish them on the bus.
    /// Returns how many were delivered.
    ///
    /// Queues without a live local consumer are left in the store.
    pub async fn pull_once(&self) -> Result<usize> {
        let mut delivered = 0;
        for routing in &self.pulls {
            for _ in 0..MAX_PULL_PER_QUEUE {
                if !self.bus.has_consumer(&routing.exchange, &routing.routing_key) {
                    break;
                }
                let Some(row) = queue::claim(
                    &self.pool,
                    &routing.exchange,
                    &routing.routing_key,
                    &self.consumer_id,
                    self.lease,
                )
                .await?
                else {
                    break;
                };

                if let Err(e) = self.bus.publish_value(routing, row.payload) {
                    queue::release(&self.pool, row.id).await?;
                    return Err(e.into());
                }
                queue::ack(&self.pool, row.id).await?;
                delivered += 1;
            }
        }
        if delivered > 0 {
            debug!(delivered, "Pulled messages from the shared queues");
        }
        Ok(delivered)
    }

    /// Relay until `shutdown_signal` resolves, then enqueue what is left
    /// on the outlet.
    pub async fn run_with_shutdown<S>(mut self, shutdown_signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let queues: Vec<&str> = self.pulls.iter().map(|r| r.routing_key.as_str()).collect();
        info!(consumer_id = %self.consumer_id, ?queues, "Starting queue relay");

        tokio::pin!(shutdown_signal);
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown_signal => {
                    self.outlet.close();
                    let result = self.push_pending().await;
                    info!(unsent = self.unsent.len(), "Queue relay stopped");
                    return result.map(|_| ());
                }

                msg = self.outlet.recv() => {
                    let Some(msg) = msg else {
                        warn!("Bus outlet closed");
                        return Err(WorkerError::StreamEnded);
                    };
                    self.unsent.push_back(msg);
                    if let Err(e) = self.push_pending().await {
                        error!(unsent = self.unsent.len(), "Failed to enqueue messages: {}", e);
                    }
                }

                _ = poll.tick() => {
                    if !self.unsent.is_empty() {
                        if let Err(e) = self.push_pending().await {
                            error!(unsent = self.unsent.len(), "Failed to enqueue messages: {}", e);
                        }
                    }
                    if let Err(e) = self.pull_once().await {
                        error!("Failed to pull from the shared queues: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use database::Database;
    use message_bus::ApiCommand;
    use serde_json::{json, Map, Value};

    #[tokio::test]
    async fn test_push_unconsumed_to_store() {
        let db = Database::in_memory().await.unwrap();
        let bus = MessageBus::new();
        let mut relay = QueueRelay::new(db.pool().clone(), bus.clone(), "a").unwrap();

        bus.publish(&RoutingConfig::control("remote"), &json!({"n": 1}))
            .unwrap();
        assert_eq!(relay.push_pending().await.unwrap(), 1);
        assert_eq!(relay.push_pending().await.unwrap(), 0);

        let row = queue::claim(db.pool(), "vumi", "remote.control", "b", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.payload, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_pull_only_consumed_queues() {
        let db = Database::in_memory().await.unwrap();
        let pool = db.pool();
        let bus = MessageBus::new();
        let mut control = bus.consume::<Value>("vumi", "w.control").unwrap();
        let relay = QueueRelay::new(pool.clone(), bus.clone(), "a")
            .unwrap()
            .pull(RoutingConfig::control("w"))
            .pull(RoutingConfig::transport_inbound("sms"));

        queue::enqueue(pool, "vumi", "w.control", &json!({"n": 1})).await.unwrap();
        queue::enqueue(pool, "vumi", "w.control", &json!({"n": 2})).await.unwrap();
        queue::enqueue(pool, "vumi", "sms.inbound", &json!({"n": 3})).await.unwrap();

        assert_eq!(relay.pull_once().await.unwrap(), 2);
        assert_eq!(control.try_recv().unwrap().unwrap(), json!({"n": 1}));
        assert_eq!(control.try_recv().unwrap().unwrap(), json!({"n": 2}));
        assert_eq!(queue::depth(pool, "vumi", "w.control").await.unwrap(), 0);
        // Nobody here consumes sms.inbound.
        assert_eq!(queue::depth(pool, "vumi", "sms.inbound").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processes_share_queues_through_store() {
        let db = Database::in_memory().await.unwrap();

        let sender_bus = MessageBus::new();
        let mut sender = QueueRelay::new(db.pool().clone(), sender_bus.clone(), "sender").unwrap();

        let receiver_bus = MessageBus::new();
        let mut control = receiver_bus.consume::<ApiCommand>("vumi", "w.control").unwrap();
        let receiver = QueueRelay::new(db.pool().clone(), receiver_bus, "receiver")
            .unwrap()
            .pull(RoutingConfig::control("w"))
            .with_poll_interval(Duration::from_millis(10));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(receiver.run_with_shutdown(async {
            let _ = stop_rx.await;
        }));

        let cmd = ApiCommand::command("w", "collect_metrics", Map::new());
        sender_bus.publish(&RoutingConfig::control("w"), &cmd).unwrap();
        sender.push_pending().await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), control.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received, cmd);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
