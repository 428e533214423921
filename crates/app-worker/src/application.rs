//! The seam between the worker core and a conversation application.

use account_api::UserApi;
use async_trait::async_trait;
use message_bus::{ApiCommand, TransportEvent, UserMessage};

use crate::context::WorkerContext;
use crate::error::Result;

/// A conversation type's behaviour, driven by the worker core.
///
/// The core owns the control queue, the command table, duplicate
/// suppression and message/event resolution; the application only sees
/// the commands and messages meant for it.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Verbs this application handles on top of the built-in ones.
    fn commands(&self) -> Vec<String> {
        Vec::new()
    }

    /// Handle one of the verbs from [`commands`](Self::commands).
    async fn handle_command(&self, ctx: &WorkerContext, command: &ApiCommand) -> Result<()>;

    /// Publish metrics for a conversation.
    ///
    /// Default: message counts summed over the conversation's batches.
    async fn collect_metrics(
        &self,
        ctx: &WorkerContext,
        user_api: &UserApi,
        conversation_key: &str,
    ) -> Result<()> {
        if let Some(conversation) = user_api.get_conversation(conversation_key).await? {
            ctx.collect_message_metrics(&conversation).await?;
        }
        Ok(())
    }

    /// A message arrived from a user. It has already been stored.
    async fn consume_user_message(&self, ctx: &WorkerContext, msg: &UserMessage) -> Result<()> {
        let _ = (ctx, msg);
        Ok(())
    }

    /// A transport event arrived for `msg`, one of our outbound messages.
    /// It has already been stored.
    async fn consume_event(
        &self,
        ctx: &WorkerContext,
        event: &TransportEvent,
        msg: &UserMessage,
    ) -> Result<()> {
        let _ = (ctx, event, msg);
        Ok(())
    }

    /// Release application resources. Called once during teardown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
