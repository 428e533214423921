//! Shared facade over the stores and the command bus.

use std::sync::Arc;

use database::{account, message_store, tagpool, BatchStatus, Database, SqlitePool, Tag};
use message_bus::{ApiCommand, MessageBus, RoutingConfig};
use serde_json::{Map, Value};
use tracing::debug;

use crate::contact::{ContactStore, MemoryContactStore};
use crate::error::Result;
use crate::opt_out::{MemoryOptOutStore, OptOutStore};
use crate::user_api::UserApi;

/// Entry point for the web tier and workers.
///
/// Cheap to clone; clones share the database pool, bus and stores.
#[derive(Clone)]
pub struct CampaignApi {
    db: Database,
    bus: MessageBus,
    command_routing: RoutingConfig,
    contacts: Arc<dyn ContactStore>,
    opt_outs: Arc<dyn OptOutStore>,
}

impl CampaignApi {
    /// Create an API with in-memory contact and opt-out stores.
    pub fn new(db: Database, bus: MessageBus) -> Self {
        Self {
            db,
            bus,
            command_routing: ApiCommand::default_routing_config(),
            contacts: Arc::new(MemoryContactStore::new()),
            opt_outs: Arc::new(MemoryOptOutStore::new()),
        }
    }

    /// Publish commands with a different routing config.
    pub fn with_command_routing(mut self, routing: RoutingConfig) -> Self {
        self.command_routing = routing;
        self
    }

    /// Use another contact store.
    pub fn with_contact_store(mut self, contacts: Arc<dyn ContactStore>) -> Self {
        self.contacts = contacts;
        self
    }

    /// Use another opt-out store.
    pub fn with_opt_out_store(mut self, opt_outs: Arc<dyn OptOutStore>) -> Self {
        self.opt_outs = opt_outs;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn command_routing(&self) -> &RoutingConfig {
        &self.command_routing
    }

    pub fn contact_store(&self) -> &Arc<dyn ContactStore> {
        &self.contacts
    }

    pub fn opt_out_store(&self) -> &Arc<dyn OptOutStore> {
        &self.opt_outs
    }

    /// API scoped to one account.
    pub fn user_api(&self, account_key: impl Into<String>) -> UserApi {
        UserApi::new(self.clone(), account_key)
    }

    /// Whether an account exists.
    pub async fn user_exists(&self, account_key: &str) -> Result<bool> {
        Ok(account::account_exists(self.pool(), account_key).await?)
    }

    /// Publish a command for `worker_name`. Returns the published envelope.
    pub fn send_command(
        &self,
        worker_name: &str,
        command: &str,
        kwargs: Map<String, Value>,
    ) -> Result<ApiCommand> {
        let cmd = ApiCommand::command(worker_name, command, kwargs);
        self.bus.publish(&self.command_routing, &cmd)?;
        debug!(worker_name, command, message_id = %cmd.message_id, "Sent command");
        Ok(cmd)
    }

    /// Declare tags into their pools.
    pub async fn declare_tags(&self, tags: &[Tag]) -> Result<u64> {
        Ok(tagpool::declare_tags(self.pool(), tags).await?)
    }

    /// Open a batch over `tags`.
    pub async fn batch_start(&self, tags: &[Tag], metadata: &Map<String, Value>) -> Result<String> {
        Ok(message_store::batch_start(self.pool(), tags, metadata).await?)
    }

    /// Close a batch.
    pub async fn batch_done(&self, batch_id: &str) -> Result<()> {
        Ok(message_store::batch_done(self.pool(), batch_id).await?)
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        Ok(message_store::batch_status(self.pool(), batch_id).await?)
    }

    pub async fn batch_tags(&self, batch_id: &str) -> Result<Vec<Tag>> {
        Ok(message_store::batch_tags(self.pool(), batch_id).await?)
    }

    pub async fn batch_outbound_keys(&self, batch_id: &str) -> Result<Vec<String>> {
        Ok(message_store::batch_outbound_keys(self.pool(), batch_id).await?)
    }

    pub async fn batch_inbound_keys(&self, batch_id: &str) -> Result<Vec<String>> {
        Ok(message_store::batch_inbound_keys(self.pool(), batch_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn api() -> CampaignApi {
        let db = Database::in_memory().await.unwrap();
        CampaignApi::new(db, MessageBus::new())
    }

    #[tokio::test]
    async fn test_send_command_publishes_to_api_queue() {
        let api = api().await;
        for addr in ["+12", "+34"] {
            let mut kwargs = Map::new();
            kwargs.insert("batch_id".into(), Value::from("b123"));
            kwargs.insert("to_addr".into(), Value::from(addr));
            api.send_command("dummy_worker", "send", kwargs).unwrap();
        }

        let published = api.bus().take_messages("vumi", "vumi.api");
        let to_addrs: Vec<&str> = published
            .iter()
            .filter_map(|cmd| cmd["kwargs"]["to_addr"].as_str())
            .collect();
        assert_eq!(to_addrs, vec!["+12", "+34"]);
        assert_eq!(published[0]["worker_name"], "dummy_worker");
    }

    #[tokio::test]
    async fn test_batch_tags_in_order() {
        let api = api().await;
        let tags = vec![Tag::new("poolA", "tag1"), Tag::new("poolA", "tag2")];
        let batch_id = api.batch_start(&tags, &Map::new()).await.unwrap();
        assert_eq!(api.batch_tags(&batch_id).await.unwrap(), tags);
        assert_eq!(api.batch_status(&batch_id).await.unwrap().sent, 0);
    }

    #[tokio::test]
    async fn test_user_exists() {
        let api = api().await;
        account::create_account(api.pool(), "acc-1", "Buster").await.unwrap();
        assert!(api.user_exists("acc-1").await.unwrap());
        assert!(!api.user_exists("foo").await.unwrap());
    }
}
