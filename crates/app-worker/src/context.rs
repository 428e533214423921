//! Shared state handed to command handlers and application hooks.

use std::sync::Arc;

use account_api::{CampaignApi, UserApi};
use database::{message_store, Conversation, SqlitePool};
use message_bus::{ApiEvent, MessageBus, Publisher, RoutingConfig, UserMessage};
use tracing::{debug, error, info};

use crate::config::{ConversationConfig, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::inflight::InFlightTracker;
use crate::metrics::{Aggregator, MetricManager};

/// Everything a handler needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct WorkerContext {
    config: Arc<WorkerConfig>,
    api: CampaignApi,
    metrics: Arc<MetricManager>,
    metrics_in_flight: InFlightTracker,
    reconcile_in_flight: InFlightTracker,
    app_events: Publisher,
}

impl WorkerContext {
    pub fn new(config: WorkerConfig, api: CampaignApi) -> Self {
        let metrics = MetricManager::new(
            config.metrics_prefix.clone(),
            api.bus().publisher(RoutingConfig::metrics()),
        );
        let app_events = api.bus().publisher(config.app_event_routing.clone());
        Self {
            config: Arc::new(config),
            api,
            metrics: Arc::new(metrics),
            metrics_in_flight: InFlightTracker::new(),
            reconcile_in_flight: InFlightTracker::new(),
            app_events,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn api(&self) -> &CampaignApi {
        &self.api
    }

    pub fn bus(&self) -> &MessageBus {
        self.api.bus()
    }

    pub fn pool(&self) -> &SqlitePool {
        self.api.pool()
    }

    pub fn metrics(&self) -> &Arc<MetricManager> {
        &self.metrics
    }

    /// Keys with a `collect_metrics` handler running.
    pub fn metrics_in_flight(&self) -> &InFlightTracker {
        &self.metrics_in_flight
    }

    /// Keys with a `reconcile_cache` handler running.
    pub fn reconcile_in_flight(&self) -> &InFlightTracker {
        &self.reconcile_in_flight
    }

    pub fn user_api(&self, account_key: &str) -> UserApi {
        self.api.user_api(account_key)
    }

    pub fn conversation_config<'a>(&'a self, conversation: &'a Conversation) -> ConversationConfig<'a> {
        self.config.conversation_config(conversation)
    }

    /// Publish an application event.
    pub fn publish_app_event(&self, event: &ApiEvent) -> Result<()> {
        self.app_events.publish(event)?;
        debug!(
            account_key = %event.account_key,
            conversation_key = %event.conversation_key,
            event_type = %event.event_type,
            "Published application event"
        );
        Ok(())
    }

    /// Hand a message to the transport named on it, or this worker's transport.
    pub fn send_to_transport(&self, msg: &UserMessage) -> Result<()> {
        let transport = msg
            .transport_name
            .as_deref()
            .or(self.config.transport_name.as_deref())
            .ok_or_else(|| {
                WorkerError::Application(format!("no transport for message {}", msg.message_id))
            })?;
        self.bus()
            .publish(&RoutingConfig::transport_outbound(transport), msg)?;
        Ok(())
    }

    /// Record `<account>.<conversation>.<name>`.
    pub fn publish_conversation_metric(
        &self,
        conversation: &Conversation,
        name: &str,
        value: f64,
        aggregator: Aggregator,
    ) {
        let name = format!("{}.{}.{}", conversation.account_key, conversation.key, name);
        self.metrics.record(&name, value, aggregator);
    }

    /// Record `<account>.<store>.<name>`.
    pub fn publish_account_metric(
        &self,
        account_key: &str,
        store: &str,
        name: &str,
        value: f64,
        aggregator: Aggregator,
    ) {
        let name = format!("{}.{}.{}", account_key, store, name);
        self.metrics.record(&name, value, aggregator);
    }

    /// Publish `messages_sent` and `messages_received` summed over the
    /// conversation's batches.
    pub async fn collect_message_metrics(&self, conversation: &Conversation) -> Result<()> {
        let mut sent = 0;
        let mut received = 0;
        for batch_id in &conversation.batches {
            let counts = message_store::cached_counts(self.pool(), batch_id).await?;
            sent += counts.outbound_count;
            received += counts.inbound_count;
        }
        self.publish_conversation_metric(conversation, "messages_sent", sent as f64, Aggregator::Max);
        self.publish_conversation_metric(
            conversation,
            "messages_received",
            received as f64,
            Aggregator::Max,
        );
        Ok(())
    }

    /// Rebuild the counters of every batch of a conversation that drifted
    /// more than `delta`. Returns how many batches were rebuilt.
    ///
    /// A missing conversation is logged and skipped.
    pub async fn reconcile_cache(
        &self,
        user_api: &UserApi,
        conversation_key: &str,
        delta: f64,
    ) -> Result<usize> {
        let Some(conversation) = user_api.get_conversation(conversation_key).await? else {
            error!(
                conversation_key,
                account_key = user_api.account_key(),
                "Conversation does not exist, not reconciling"
            );
            return Ok(0);
        };

        let mut reconciled = 0;
        for batch_id in &conversation.batches {
            if message_store::needs_reconciliation(self.pool(), batch_id, delta).await? {
                info!(conversation_key, batch_id = %batch_id, "Reconciling batch counters");
                message_store::reconcile_cache(self.pool(), batch_id).await?;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }
}
