//! Fixtures shared by the worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use account_api::{CampaignApi, Contact, MemoryContactStore, PoolMetadata, UserApi};
use app_worker::WorkerConfig;
use database::{account, tagpool, Database, NewConversation, Tag};
use message_bus::{ApiCommand, ApiEvent, MessageBus, MetricMessage, UserMessage};
use serde_json::{Map, Value};

pub const ACCOUNT: &str = "acc-1";
pub const TRANSPORT: &str = "sms_transport";

pub fn longcode() -> Tag {
    Tag::new("longcode", "+2783")
}

/// An account allowed to use one `longcode` tag, with two contacts in
/// `group-1`.
pub async fn api() -> CampaignApi {
    let db = Database::in_memory().await.unwrap();
    account::create_account(db.pool(), ACCOUNT, "Buster").await.unwrap();
    account::add_tagpool_permission(db.pool(), ACCOUNT, "longcode", None)
        .await
        .unwrap();
    tagpool::declare_tags(db.pool(), &[longcode()]).await.unwrap();
    let pool = PoolMetadata::default()
        .with_transport_type("sms")
        .server_initiated();
    tagpool::set_metadata(db.pool(), "longcode", &pool.to_map())
        .await
        .unwrap();

    let contacts = Arc::new(MemoryContactStore::new());
    contacts
        .add_contact(ACCOUNT, Contact::with_msisdn("c1", "+2781").in_group("group-1"))
        .await;
    contacts
        .add_contact(ACCOUNT, Contact::with_msisdn("c2", "+2782").in_group("group-1"))
        .await;

    CampaignApi::new(db, MessageBus::new()).with_contact_store(contacts)
}

pub fn config() -> WorkerConfig {
    WorkerConfig::new("bulk_message_application", "go.campaigns.").with_transport_name(TRANSPORT)
}

pub fn bulk_message() -> NewConversation {
    NewConversation::new("bulk_message", "Launch", "Hello!")
        .with_delivery_class("sms")
        .with_delivery_pool("longcode")
        .with_group("group-1")
}

pub fn command(verb: &str, conversation_key: &str) -> ApiCommand {
    let mut kwargs = Map::new();
    kwargs.insert("conversation_key".into(), Value::from(conversation_key));
    kwargs.insert("user_account_key".into(), Value::from(ACCOUNT));
    ApiCommand::command("bulk_message_application", verb, kwargs)
}

pub fn sent_commands(user_api: &UserApi) -> Vec<ApiCommand> {
    decode_all(user_api.api().bus(), "vumi.api")
}

pub fn app_events(bus: &MessageBus) -> Vec<ApiEvent> {
    decode_all(bus, "vumi.event")
}

pub fn outbound(bus: &MessageBus) -> Vec<UserMessage> {
    decode_all(bus, &format!("{}.outbound", TRANSPORT))
}

pub fn metrics(bus: &MessageBus) -> Vec<MetricMessage> {
    decode_all(bus, "vumi.metrics")
}

fn decode_all<T: serde::de::DeserializeOwned>(bus: &MessageBus, routing_key: &str) -> Vec<T> {
    bus.take_messages("vumi", routing_key)
        .into_iter()
        .map(|value| serde_json::from_value(value).unwrap())
        .collect()
}
