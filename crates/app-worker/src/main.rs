//! Campaign application worker.
//!
//! Runs the bulk-message application on its control queue and, when
//! `DISPATCHER_WORKERS` is set, a dispatcher forwarding `vumi.api` commands
//! to those workers' control queues. A queue relay carries messages
//! between this process and the durable queues in the shared database.

use account_api::CampaignApi;
use app_worker::{
    ApplicationWorker, BulkMessageApplication, CommandDispatcher, QueueRelay, WorkerConfig,
};
use clap::Parser;
use database::Database;
use message_bus::MessageBus;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "app-worker", about = "Run a campaign application worker")]
struct Args {
    /// Worker name; overrides WORKER_NAME.
    #[arg(long)]
    worker_name: Option<String>,

    /// SQLite database URL; overrides DATABASE_URL.
    #[arg(long)]
    database_url: Option<String>,

    /// Transport to consume inbound messages and events from; overrides TRANSPORT_NAME.
    #[arg(long)]
    transport_name: Option<String>,
}

impl Args {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "WORKER_NAME" => self.worker_name.clone(),
            "DATABASE_URL" => self.database_url.clone(),
            "TRANSPORT_NAME" => self.transport_name.clone(),
            _ => None,
        }
    }
}

async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env_with(|name| args.lookup(name))?;
    info!(worker = %config.worker_name, "Starting app worker");

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;

    let pool = db.pool().clone();
    let bus = MessageBus::new();
    let api = CampaignApi::new(db, bus.clone()).with_command_routing(config.api_routing.clone());

    let dispatcher = if config.dispatcher_workers.is_empty() {
        None
    } else {
        Some(CommandDispatcher::new(
            bus.clone(),
            config.api_routing.clone(),
            config.dispatcher_workers.clone(),
        )?)
    };

    let relay_config = config.clone();
    let worker = ApplicationWorker::setup_with_api(config, BulkMessageApplication::new(), api).await?;
    // After the worker and dispatcher consumers exist, so backlogs for them stay local.
    let relay = QueueRelay::for_worker(&relay_config, pool, bus)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        let _ = stop_tx.send(true);
    });

    let (relay_stop_tx, relay_stop_rx) = watch::channel(false);
    let relay = tokio::spawn(relay.run_with_shutdown(stopped(relay_stop_rx)));
    let dispatcher = dispatcher.map(|d| tokio::spawn(d.run_with_shutdown(stopped(stop_rx.clone()))));

    let result = worker.run_with_shutdown(stopped(stop_rx)).await;
    if let Some(dispatcher) = dispatcher {
        dispatcher.await??;
    }

    // The relay stops last so whatever the worker published is enqueued.
    let _ = relay_stop_tx.send(true);
    relay.await??;
    result?;

    info!("App worker stopped");
    Ok(())
}
