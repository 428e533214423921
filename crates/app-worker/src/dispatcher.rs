//! Forwards commands from the shared API queue to workers' control queues.

use std::collections::HashSet;
use std::future::Future;

use message_bus::{ApiCommand, Consumer, MessageBus, RoutingConfig};
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};

/// Consumes `vumi.api` (or the configured command routing) and republishes
/// each command on `<worker_name>.control` for the workers it knows.
pub struct CommandDispatcher {
    bus: MessageBus,
    api_routing: RoutingConfig,
    workers: HashSet<String>,
    consumer: Consumer<ApiCommand>,
}

impl CommandDispatcher {
    /// Attach to the command queue.
    pub fn new<I, S>(bus: MessageBus, api_routing: RoutingConfig, workers: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let consumer = bus.consume(&api_routing.exchange, &api_routing.routing_key)?;
        Ok(Self {
            bus,
            api_routing,
            workers: workers.into_iter().map(Into::into).collect(),
            consumer,
        })
    }

    pub fn workers(&self) -> &HashSet<String> {
        &self.workers
    }

    /// Republish a command to its worker. Returns `false` for workers this
    /// dispatcher does not serve.
    pub fn forward(&self, command: &ApiCommand) -> Result<bool> {
        if !self.workers.contains(&command.worker_name) {
            warn!(
                worker_name = %command.worker_name,
                command = %command.command,
                "No such worker, dropping command"
            );
            return Ok(false);
        }
        let routing = RoutingConfig::control(&command.worker_name)
            .with_exchange(self.api_routing.exchange.clone());
        self.bus.publish(&routing, command)?;
        debug!(
            worker_name = %command.worker_name,
            command = %command.command,
            "Forwarded command"
        );
        Ok(true)
    }

    /// Forward commands until `shutdown_signal` resolves.
    pub async fn run_with_shutdown<S>(mut self, shutdown_signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        info!(workers = ?self.workers, "Starting command dispatcher");

        tokio::pin!(shutdown_signal);

        loop {
            tokio::select! {
                biased;

                () = &mut shutdown_signal => {
                    info!("Shutdown signal received, stopping command dispatcher");
                    self.consumer.close();
                    return Ok(());
                }

                command = self.consumer.recv() => {
                    match command {
                        Some(Ok(command)) => {
                            if let Err(e) = self.forward(&command) {
                                error!("Failed to forward command: {}", e);
                            }
                        }
                        Some(Err(e)) => error!("Invalid command on API queue: {}", e),
                        None => {
                            warn!("Command stream ended");
                            return Err(WorkerError::StreamEnded);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[tokio::test]
    async fn test_forwards_known_workers_only() {
        let bus = MessageBus::new();
        let dispatcher = CommandDispatcher::new(
            bus.clone(),
            RoutingConfig::api_commands(),
            ["bulk_message_application"],
        )
        .unwrap();

        let known = ApiCommand::command("bulk_message_application", "start", Map::new());
        let unknown = ApiCommand::command("survey_application", "start", Map::new());
        assert!(dispatcher.forward(&known).unwrap());
        assert!(!dispatcher.forward(&unknown).unwrap());

        let forwarded = bus.take_messages("vumi", "bulk_message_application.control");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["command"], "start");
        assert_eq!(bus.pending("vumi", "survey_application.control"), 0);
    }

    #[tokio::test]
    async fn test_run_forwards_from_api_queue() {
        let bus = MessageBus::new();
        let dispatcher = CommandDispatcher::new(
            bus.clone(),
            RoutingConfig::api_commands(),
            ["bulk_message_application"],
        )
        .unwrap();
        let mut control = bus
            .consume::<ApiCommand>("vumi", "bulk_message_application.control")
            .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(dispatcher.run_with_shutdown(async {
            let _ = stop_rx.await;
        }));

        let command = ApiCommand::command("bulk_message_application", "collect_metrics", Map::new());
        bus.publish(&RoutingConfig::api_commands(), &command).unwrap();

        let received = control.recv().await.unwrap().unwrap();
        assert_eq!(received.message_id, command.message_id);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
