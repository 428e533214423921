//! Attribute messages and transport events to accounts and conversations.
//!
//! Resolution prefers the routing metadata written into a message when it
//! was sent (`helper_metadata.go`). Messages without it fall back to the
//! batch they were stored under, or the current batch of their tag, whose
//! metadata names the owning account.
//!
//! Missing entities are logged and resolve to `None`; only store failures
//! surface as errors.

use account_api::Contact;
use database::{conversation, message_store, Conversation, DatabaseError};
use message_bus::{ApiEvent, TransportEvent, UserMessage};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::context::WorkerContext;
use crate::error::Result;

impl WorkerContext {
    /// The stored outbound message an event refers to.
    pub async fn find_outbound_message_for_event(
        &self,
        event: &TransportEvent,
    ) -> Result<Option<UserMessage>> {
        let Some(message_id) = event.user_message_id.as_deref() else {
            error!(event_id = %event.event_id, "Event has no user_message_id");
            return Ok(None);
        };

        let msg = message_store::get_outbound_message(self.pool(), message_id).await?;
        if msg.is_none() {
            error!(
                event_id = %event.event_id,
                user_message_id = message_id,
                "Outbound message for event not found"
            );
        }
        Ok(msg)
    }

    /// Batch a message belongs to: the batch it was stored under, else the
    /// current batch of its tag.
    pub async fn batch_for_message(&self, msg: &UserMessage) -> Result<Option<String>> {
        if let Some(batch_id) = message_store::outbound_message_batch(self.pool(), &msg.message_id).await? {
            return Ok(Some(batch_id));
        }
        match msg.tag() {
            Some(tag) => Ok(message_store::get_tag_info(self.pool(), &tag).await?.current_batch),
            None => Ok(None),
        }
    }

    /// Account a message was sent for or received on.
    pub async fn account_key_for_message(&self, msg: &UserMessage) -> Result<Option<String>> {
        if let Some(account_key) = msg.go_metadata().user_account {
            return Ok(Some(account_key));
        }
        let Some(batch_id) = self.batch_for_message(msg).await? else {
            return Ok(None);
        };
        match message_store::get_batch(self.pool(), &batch_id).await {
            Ok(batch) => Ok(batch.user_account().map(String::from)),
            Err(DatabaseError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Conversation owning `batch_id`.
    ///
    /// With `conversation_key` the conversation is loaded directly for the
    /// batch's account; otherwise it is looked up by batch.
    pub async fn conversation_for_batch(
        &self,
        batch_id: &str,
        conversation_key: Option<&str>,
    ) -> Result<Option<Conversation>> {
        let batch = match message_store::get_batch(self.pool(), batch_id).await {
            Ok(batch) => batch,
            Err(DatabaseError::NotFound { .. }) => {
                error!(batch_id, "Batch not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let Some(account_key) = batch.user_account() else {
            error!(batch_id, "No user account key for batch");
            return Ok(None);
        };

        let found = match conversation_key {
            Some(key) => self.user_api(account_key).get_conversation(key).await?,
            None => conversation::find_conversation_by_batch(self.pool(), batch_id)
                .await?
                .filter(|conv| conv.account_key == account_key),
        };
        if found.is_none() {
            error!(batch_id, account_key, ?conversation_key, "Conversation for batch not found");
        }
        Ok(found)
    }

    /// Conversation a message belongs to.
    pub async fn conversation_for_message(&self, msg: &UserMessage) -> Result<Option<Conversation>> {
        let go = msg.go_metadata();
        if let (Some(account_key), Some((key, _))) = (&go.user_account, go.conversation_info()) {
            return Ok(self.user_api(account_key).get_conversation(key).await?);
        }

        let Some(batch_id) = self.batch_for_message(msg).await? else {
            debug!(message_id = %msg.message_id, "Message has no routing metadata or batch");
            return Ok(None);
        };
        self.conversation_for_batch(&batch_id, go.conversation_key.as_deref())
            .await
    }

    /// Build an application event about the conversation `msg` belongs to.
    pub async fn event_for_message(
        &self,
        msg: &UserMessage,
        event_type: &str,
        content: Map<String, Value>,
    ) -> Result<Option<ApiEvent>> {
        let event = self
            .conversation_for_message(msg)
            .await?
            .map(|conv| ApiEvent::event(conv.account_key, conv.key, event_type, content));
        Ok(event)
    }

    /// Publish an application event for `msg`. Returns whether one was sent.
    pub async fn trigger_event(
        &self,
        msg: &UserMessage,
        event_type: &str,
        content: Map<String, Value>,
    ) -> Result<bool> {
        match self.event_for_message(msg, event_type, content).await? {
            Some(event) => {
                self.publish_app_event(&event)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Contact on the user side of `msg`.
    pub async fn contact_for_message(&self, msg: &UserMessage) -> Result<Option<Contact>> {
        let Some(conv) = self.conversation_for_message(msg).await? else {
            return Ok(None);
        };
        let Some(delivery_class) = conv.delivery_class.as_deref() else {
            return Ok(None);
        };
        let contact = self
            .api()
            .contact_store()
            .contact_for_addr(&conv.account_key, delivery_class, msg.user())
            .await?;
        Ok(contact)
    }
}
