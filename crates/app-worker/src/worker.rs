//! The application worker: consumes its control queue and transport
//! queues and dispatches to an [`Application`].

use std::future::Future;
use std::sync::Arc;

use account_api::CampaignApi;
use database::{message_store, Database};
use message_bus::{ApiCommand, BusError, Consumer, MessageBus, RoutingConfig, TransportEvent, UserMessage};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::command::{CommandOutcome, CommandTable, Verb};
use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};

/// Routes commands, messages and events to the core handlers or the
/// application. Clones share all state.
pub struct CommandRunner<A> {
    ctx: WorkerContext,
    app: Arc<A>,
    commands: Arc<CommandTable>,
}

impl<A> Clone for CommandRunner<A> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            app: Arc::clone(&self.app),
            commands: Arc::clone(&self.commands),
        }
    }
}

impl<A: Application> CommandRunner<A> {
    /// Build a runner, validating the application's verbs.
    pub fn new(ctx: WorkerContext, app: A) -> Result<Self> {
        let commands = CommandTable::new(app.commands())?;
        Ok(Self {
            ctx,
            app: Arc::new(app),
            commands: Arc::new(commands),
        })
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn application(&self) -> &A {
        &self.app
    }

    /// Run the handler for one command.
    ///
    /// Never fails: every anomaly is logged and reported in the outcome.
    pub async fn dispatch(&self, command: &ApiCommand) -> CommandOutcome {
        let Some(verb) = self.commands.resolve(&command.command) else {
            error!(
                worker = self.app.name(),
                command = %command.command,
                message_id = %command.message_id,
                "Unknown command"
            );
            return CommandOutcome::UnknownCommand;
        };

        let result = match verb {
            Verb::CollectMetrics => self.process_collect_metrics(command).await,
            Verb::ReconcileCache => self.process_reconcile_cache(command).await,
            Verb::Application(_) => self
                .app
                .handle_command(&self.ctx, command)
                .await
                .map(|()| CommandOutcome::Handled),
        };

        result.unwrap_or_else(|e| {
            warn!(command = %command.command, "Command failed: {}", e);
            CommandOutcome::Failed(e.to_string())
        })
    }

    async fn process_collect_metrics(&self, command: &ApiCommand) -> Result<CommandOutcome> {
        let (conversation_key, account_key) = conversation_arguments(command)?;

        let Some(_guard) = self.ctx.metrics_in_flight().try_mark(conversation_key, account_key)
        else {
            info!(
                conversation_key,
                account_key, "Metrics collection already in progress, dropping command"
            );
            return Ok(CommandOutcome::Duplicate);
        };

        let user_api = self.ctx.user_api(account_key);
        self.app
            .collect_metrics(&self.ctx, &user_api, conversation_key)
            .await?;
        Ok(CommandOutcome::Handled)
    }

    async fn process_reconcile_cache(&self, command: &ApiCommand) -> Result<CommandOutcome> {
        let (conversation_key, account_key) = conversation_arguments(command)?;
        let delta = command
            .argument(2, "delta")
            .and_then(Value::as_f64)
            .unwrap_or(message_store::DEFAULT_RECONCILIATION_DELTA);

        let Some(_guard) = self
            .ctx
            .reconcile_in_flight()
            .try_mark(conversation_key, account_key)
        else {
            info!(
                conversation_key,
                account_key, "Cache reconciliation already in progress, dropping command"
            );
            return Ok(CommandOutcome::Duplicate);
        };

        let user_api = self.ctx.user_api(account_key);
        let reconciled = self
            .ctx
            .reconcile_cache(&user_api, conversation_key, delta)
            .await?;
        debug!(conversation_key, reconciled, "Cache reconciliation finished");
        Ok(CommandOutcome::Handled)
    }

    /// Pass an inbound message to the application, then store it.
    ///
    /// A message is stored only once the application has handled it, so a
    /// redelivery after a failed handler is handled again. A message that is
    /// already stored is skipped.
    pub async fn process_user_message(&self, msg: &UserMessage) -> Result<()> {
        if message_store::get_inbound_message(self.ctx.pool(), &msg.message_id)
            .await?
            .is_some()
        {
            debug!(message_id = %msg.message_id, "Inbound message already handled");
            return Ok(());
        }
        self.app.consume_user_message(&self.ctx, msg).await?;
        message_store::add_inbound_message(self.ctx.pool(), msg, None).await?;
        Ok(())
    }

    /// Pass a transport event to the application, then store it.
    ///
    /// Returns `false` if the event was dropped: it refers to no stored
    /// outbound message, or it was already stored.
    pub async fn process_event(&self, event: &TransportEvent) -> Result<bool> {
        let Some(msg) = self.ctx.find_outbound_message_for_event(event).await? else {
            return Ok(false);
        };
        if message_store::has_event(self.ctx.pool(), &event.event_id).await? {
            debug!(event_id = %event.event_id, "Event already handled");
            return Ok(false);
        }
        self.app.consume_event(&self.ctx, event, &msg).await?;
        message_store::add_event(self.ctx.pool(), event).await?;
        Ok(true)
    }
}

fn conversation_arguments(command: &ApiCommand) -> Result<(&str, &str)> {
    let conversation_key = command
        .str_argument(0, "conversation_key")
        .ok_or_else(|| WorkerError::invalid_command(&command.command, "missing conversation_key"))?;
    let account_key = command
        .str_argument(1, "user_account_key")
        .ok_or_else(|| WorkerError::invalid_command(&command.command, "missing user_account_key"))?;
    Ok((conversation_key, account_key))
}

fn consume<T: DeserializeOwned>(bus: &MessageBus, routing: &RoutingConfig) -> Result<Consumer<T>> {
    Ok(bus.consume(&routing.exchange, &routing.routing_key)?)
}

type Consumers = (
    Consumer<ApiCommand>,
    Option<Consumer<UserMessage>>,
    Option<Consumer<TransportEvent>>,
);

fn attach_consumers(ctx: &WorkerContext) -> Result<Consumers> {
    let control = consume(ctx.bus(), &ctx.config().control_routing())?;
    let (inbound, events) = match ctx.config().transport_name.as_deref() {
        Some(transport) => (
            Some(consume(ctx.bus(), &RoutingConfig::transport_inbound(transport))?),
            Some(consume(ctx.bus(), &RoutingConfig::transport_events(transport))?),
        ),
        None => (None, None),
    };
    Ok((control, inbound, events))
}

async fn next_from<T: DeserializeOwned>(
    consumer: &mut Option<Consumer<T>>,
) -> Option<std::result::Result<T, BusError>> {
    match consumer {
        Some(consumer) => consumer.recv().await,
        None => std::future::pending().await,
    }
}

/// A running worker.
///
/// Setup order: open the store and bus, start the metrics publisher, then
/// attach the control consumer (and transport consumers when a transport
/// is configured). [`teardown`](Self::teardown) undoes these in reverse.
pub struct ApplicationWorker<A: Application> {
    runner: CommandRunner<A>,
    control: Option<Consumer<ApiCommand>>,
    inbound: Option<Consumer<UserMessage>>,
    events: Option<Consumer<TransportEvent>>,
    tasks: JoinSet<()>,
    torn_down: bool,
}

impl<A: Application> ApplicationWorker<A> {
    /// Connect to `config.database_url`, migrate, and set up on `bus`.
    pub async fn setup(config: WorkerConfig, app: A, bus: MessageBus) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        db.migrate().await?;
        Self::setup_with_api(config, app, CampaignApi::new(db, bus)).await
    }

    /// Set up on an existing API facade.
    pub async fn setup_with_api(config: WorkerConfig, app: A, api: CampaignApi) -> Result<Self> {
        let interval = config.metrics_interval;
        let ctx = WorkerContext::new(config, api);
        let runner = CommandRunner::new(ctx.clone(), app)?;

        ctx.metrics().start(interval);

        let (control, inbound, events) = match attach_consumers(&ctx) {
            Ok(consumers) => consumers,
            Err(e) => {
                ctx.metrics().stop();
                return Err(e);
            }
        };

        info!(
            worker = %ctx.config().worker_name,
            application = runner.application().name(),
            transport = ?ctx.config().transport_name,
            "Worker set up"
        );

        Ok(Self {
            runner,
            control: Some(control),
            inbound,
            events,
            tasks: JoinSet::new(),
            torn_down: false,
        })
    }

    pub fn context(&self) -> &WorkerContext {
        self.runner.context()
    }

    pub fn runner(&self) -> &CommandRunner<A> {
        &self.runner
    }

    /// Run one command to completion on the current task.
    pub async fn dispatch(&self, command: &ApiCommand) -> CommandOutcome {
        self.runner.dispatch(command).await
    }

    fn spawn_command(&mut self, command: ApiCommand) {
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            match runner.dispatch(&command).await {
                CommandOutcome::Handled => debug!(command = %command.command, "Command handled"),
                CommandOutcome::Duplicate => debug!(command = %command.command, "Duplicate command dropped"),
                CommandOutcome::UnknownCommand => debug!(command = %command.command, "Unknown command dropped"),
                CommandOutcome::Failed(reason) => {
                    debug!(command = %command.command, reason = %reason, "Command failed")
                }
            }
        });
    }

    fn spawn_user_message(&mut self, msg: UserMessage) {
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            if let Err(e) = runner.process_user_message(&msg).await {
                warn!(message_id = %msg.message_id, "Error processing inbound message: {}", e);
            }
        });
    }

    fn spawn_event(&mut self, event: TransportEvent) {
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            if let Err(e) = runner.process_event(&event).await {
                warn!(event_id = %event.event_id, "Error processing event: {}", e);
            }
        });
    }

    /// Consume until `shutdown_signal` resolves, then tear down.
    ///
    /// Commands are dispatched onto their own tasks, so a slow handler
    /// does not hold up the queue.
    pub async fn run_with_shutdown<S>(mut self, shutdown_signal: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        info!(
            worker = %self.context().config().worker_name,
            "Starting application worker (graceful shutdown enabled)"
        );

        tokio::pin!(shutdown_signal);

        let result = loop {
            tokio::select! {
                biased;

                () = &mut shutdown_signal => {
                    info!("Shutdown signal received, stopping application worker");
                    break Ok(());
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Handler task panicked: {}", e);
                    }
                }

                command = next_from(&mut self.control) => {
                    match command {
                        Some(Ok(command)) => self.spawn_command(command),
                        Some(Err(e)) => error!("Invalid control message: {}", e),
                        None => {
                            warn!("Control stream ended");
                            break Err(WorkerError::StreamEnded);
                        }
                    }
                }

                msg = next_from(&mut self.inbound) => {
                    match msg {
                        Some(Ok(msg)) => self.spawn_user_message(msg),
                        Some(Err(e)) => error!("Invalid inbound message: {}", e),
                        None => {
                            warn!("Inbound stream ended");
                            self.inbound = None;
                        }
                    }
                }

                event = next_from(&mut self.events) => {
                    match event {
                        Some(Ok(event)) => self.spawn_event(event),
                        Some(Err(e)) => error!("Invalid transport event: {}", e),
                        None => {
                            warn!("Event stream ended");
                            self.events = None;
                        }
                    }
                }
            }
        };

        self.teardown().await;
        result
    }

    /// Stop consuming, wait for running handlers, stop metrics and close
    /// the store. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(mut events) = self.events.take() {
            events.close();
        }
        if let Some(mut inbound) = self.inbound.take() {
            inbound.close();
        }
        if let Some(mut control) = self.control.take() {
            control.close();
        }

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Handler task panicked: {}", e);
            }
        }

        let ctx = self.runner.context();
        ctx.metrics().stop();
        if let Err(e) = self.runner.application().shutdown().await {
            warn!("Error during application shutdown: {}", e);
        }
        ctx.api().db().close().await;

        info!(worker = %ctx.config().worker_name, "Worker torn down");
    }
}
