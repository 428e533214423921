//! Bulk message application: sends the conversation's message to every
//! opted-in contact when the conversation starts.

use std::collections::HashSet;

use async_trait::async_trait;
use database::{message_store, Conversation};
use message_bus::{ApiCommand, EventType, GoMetadata, TransportEvent, UserMessage};
use serde_json::{Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::application::Application;
use crate::context::WorkerContext;
use crate::error::{Result, WorkerError};

/// Conversation setting: send at most one message per address.
pub const DEDUPE: &str = "dedupe";

#[derive(Debug, Clone, Default)]
pub struct BulkMessageApplication;

impl BulkMessageApplication {
    pub fn new() -> Self {
        Self
    }

    async fn process_start(&self, ctx: &WorkerContext, command: &ApiCommand) -> Result<()> {
        let required = |name: &str| {
            command
                .kwarg(name)
                .and_then(Value::as_str)
                .ok_or_else(|| WorkerError::invalid_command("start", format!("missing {}", name)))
        };
        let batch_id = required("batch_id")?;
        let conversation_key = required("conversation_key")?;
        let account_key = required("user_account_key")?;
        let msg_options = command
            .kwarg("msg_options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if command
            .kwarg("is_client_initiated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            info!(conversation_key, "Client-initiated conversation, nothing to send");
            return Ok(());
        }

        let user_api = ctx.user_api(account_key);
        let Some(conv) = user_api.get_conversation(conversation_key).await? else {
            error!(conversation_key, account_key, "Conversation does not exist, not sending");
            return Ok(());
        };

        let dedupe = ctx.conversation_config(&conv).get_bool(DEDUPE, false);
        let delivery_class = conv.delivery_class.as_deref().unwrap_or("sms");
        let mut seen = HashSet::new();
        let mut sent = 0;
        let mut skipped = 0;

        for contact in user_api.opted_in_contacts(&conv).await? {
            let Some(addr) = contact.addr_for(delivery_class) else {
                continue;
            };
            if dedupe && !seen.insert(addr.to_string()) {
                continue;
            }

            let msg = outbound_message(ctx, &conv, addr, &msg_options)
                .with_message_id(outbound_message_id(batch_id, &contact.key, addr));
            if !message_store::add_outbound_message(ctx.pool(), &msg, Some(batch_id)).await? {
                skipped += 1;
                continue;
            }
            ctx.send_to_transport(&msg)?;
            sent += 1;
        }

        if skipped > 0 {
            debug!(conversation_key, batch_id, skipped, "Messages already sent for this batch");
        }
        info!(conversation_key, batch_id, sent, "Bulk send finished");
        Ok(())
    }
}

/// The same batch, contact and address always give the same id, so a
/// redelivered `start` finds its messages already stored.
fn outbound_message_id(batch_id: &str, contact_key: &str, addr: &str) -> String {
    let name = format!("{}/{}/{}", batch_id, contact_key, addr);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string()
}

fn outbound_message(
    ctx: &WorkerContext,
    conv: &Conversation,
    to_addr: &str,
    msg_options: &Map<String, Value>,
) -> UserMessage {
    let option = |name: &str| msg_options.get(name).and_then(Value::as_str);

    let mut msg = UserMessage::new(
        to_addr,
        option("from_addr").unwrap_or_default(),
        Some(conv.message.clone()),
    );
    msg.transport_name = option("transport_name")
        .map(String::from)
        .or_else(|| ctx.config().transport_name.clone());
    msg.transport_type = option("transport_type").map(String::from);
    if let Some(Value::Object(helper_metadata)) = msg_options.get("helper_metadata") {
        msg.helper_metadata = helper_metadata.clone();
    }
    msg.set_go_metadata(
        &GoMetadata::for_account(&conv.account_key)
            .with_conversation(&conv.key, &conv.conversation_type),
    );
    msg
}

#[async_trait]
impl Application for BulkMessageApplication {
    fn name(&self) -> &str {
        "bulk_message_application"
    }

    fn commands(&self) -> Vec<String> {
        vec!["start".to_string()]
    }

    async fn handle_command(&self, ctx: &WorkerContext, command: &ApiCommand) -> Result<()> {
        match command.command.as_str() {
            "start" => self.process_start(ctx, command).await,
            other => Err(WorkerError::invalid_command(other, "not handled by bulk_message")),
        }
    }

    async fn consume_user_message(&self, ctx: &WorkerContext, msg: &UserMessage) -> Result<()> {
        let mut content = Map::new();
        content.insert("message_id".into(), Value::from(msg.message_id.clone()));
        content.insert("from_addr".into(), Value::from(msg.from_addr.clone()));
        content.insert("content".into(), msg.content.clone().map_or(Value::Null, Value::from));
        ctx.trigger_event(msg, "new_message", content).await?;
        Ok(())
    }

    async fn consume_event(
        &self,
        ctx: &WorkerContext,
        event: &TransportEvent,
        msg: &UserMessage,
    ) -> Result<()> {
        if event.event_type != EventType::DeliveryReport {
            return Ok(());
        }
        let mut content = Map::new();
        content.insert("message_id".into(), Value::from(msg.message_id.clone()));
        content.insert("to_addr".into(), Value::from(msg.to_addr.clone()));
        if let Some(status) = event.delivery_status {
            content.insert("status".into(), Value::from(status.as_str()));
        }
        ctx.trigger_event(msg, "delivery_report", content).await?;
        Ok(())
    }
}
