//! Bulk sends, replies and delivery events attributed back to their
//! conversation.

mod common;

use app_worker::{BulkMessageApplication, CommandOutcome, CommandRunner, WorkerContext};
use database::{conversation, message_store};
use message_bus::{DeliveryStatus, TransportEvent, UserMessage};
use serde_json::json;

use common::*;

async fn runner() -> CommandRunner<BulkMessageApplication> {
    let ctx = WorkerContext::new(config(), api().await);
    CommandRunner::new(ctx, BulkMessageApplication::new()).unwrap()
}

/// Start a conversation and run the `start` command it sent.
async fn started(runner: &CommandRunner<BulkMessageApplication>) -> (String, String) {
    let user_api = runner.context().user_api(ACCOUNT);
    let conv = user_api.new_conversation(&bulk_message()).await.unwrap();
    let batch_id = user_api.start_conversation(&conv.key).await.unwrap();

    let start = sent_commands(&user_api).pop().unwrap();
    assert_eq!(runner.dispatch(&start).await, CommandOutcome::Handled);
    (conv.key, batch_id)
}

#[tokio::test]
async fn test_start_sends_to_opted_in_contacts() {
    let runner = runner().await;
    let ctx = runner.context();
    ctx.api()
        .opt_out_store()
        .opt_out(ACCOUNT, "msisdn", "+2782", None)
        .await
        .unwrap();

    let (conv_key, batch_id) = started(&runner).await;

    let sent = outbound(ctx.bus());
    assert_eq!(sent.len(), 1);
    let msg = &sent[0];
    assert_eq!(msg.to_addr, "+2781");
    assert_eq!(msg.from_addr, "+2783");
    assert_eq!(msg.content.as_deref(), Some("Hello!"));
    assert_eq!(msg.transport_name.as_deref(), Some(TRANSPORT));
    assert_eq!(msg.transport_type.as_deref(), Some("sms"));

    let go = msg.go_metadata();
    assert_eq!(go.user_account.as_deref(), Some(ACCOUNT));
    assert_eq!(go.conversation_info(), Some((conv_key.as_str(), "bulk_message")));

    assert_eq!(
        message_store::batch_outbound_keys(ctx.pool(), &batch_id).await.unwrap(),
        vec![msg.message_id.clone()]
    );
}

#[tokio::test]
async fn test_redelivered_start_sends_once() {
    let runner = runner().await;
    let ctx = runner.context();
    let user_api = ctx.user_api(ACCOUNT);
    let conv = user_api.new_conversation(&bulk_message()).await.unwrap();
    let batch_id = user_api.start_conversation(&conv.key).await.unwrap();
    let start = sent_commands(&user_api).pop().unwrap();

    assert_eq!(runner.dispatch(&start).await, CommandOutcome::Handled);
    assert_eq!(runner.dispatch(&start).await, CommandOutcome::Handled);

    let sent = outbound(ctx.bus());
    assert_eq!(sent.len(), 2);
    assert_eq!(
        message_store::batch_outbound_keys(ctx.pool(), &batch_id)
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(message_store::batch_outbound_count(ctx.pool(), &batch_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_dedupe_from_conversation_metadata() {
    let runner = runner().await;
    let ctx = runner.context();
    let user_api = ctx.user_api(ACCOUNT);

    // Both contacts share one number.
    let contacts = account_api::MemoryContactStore::new();
    contacts
        .add_contact(ACCOUNT, account_api::Contact::with_msisdn("a", "+2781").in_group("group-1"))
        .await;
    contacts
        .add_contact(ACCOUNT, account_api::Contact::with_msisdn("b", "+2781").in_group("group-1"))
        .await;
    let api = ctx.api().clone().with_contact_store(std::sync::Arc::new(contacts));
    let runner = CommandRunner::new(WorkerContext::new(config(), api), BulkMessageApplication::new()).unwrap();

    let mut conv = user_api.new_conversation(&bulk_message()).await.unwrap();
    conv.metadata.insert("dedupe".into(), json!(true));
    user_api.save_conversation(&conv).await.unwrap();
    user_api.start_conversation(&conv.key).await.unwrap();

    let start = sent_commands(&user_api).pop().unwrap();
    assert_eq!(runner.dispatch(&start).await, CommandOutcome::Handled);
    assert_eq!(outbound(ctx.bus()).len(), 1);
}

#[tokio::test]
async fn test_msg_options_metadata_resolves_conversation() {
    let runner = runner().await;
    let ctx = runner.context();
    let (conv_key, batch_id) = started(&runner).await;
    let sent = outbound(ctx.bus());

    // The tag written by msg_options survives the round trip.
    assert_eq!(sent[0].tag(), Some(longcode()));

    // A reply carries only the tag the transport received it on.
    let mut reply = UserMessage::new("+2783", "+2781", Some("thanks".into()));
    reply.set_tag(&longcode());
    assert_eq!(ctx.account_key_for_message(&reply).await.unwrap().as_deref(), Some(ACCOUNT));
    assert_eq!(ctx.batch_for_message(&reply).await.unwrap().as_deref(), Some(batch_id.as_str()));

    runner.process_user_message(&reply).await.unwrap();

    let events = app_events(ctx.bus());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "new_message");
    assert_eq!(events[0].account_key, ACCOUNT);
    assert_eq!(events[0].conversation_key, conv_key);
    assert_eq!(events[0].content["content"], json!("thanks"));

    let contact = ctx.contact_for_message(&reply).await.unwrap().unwrap();
    assert_eq!(contact.key, "c1");

    assert_eq!(
        message_store::batch_inbound_keys(ctx.pool(), &batch_id).await.unwrap(),
        vec![reply.message_id.clone()]
    );
}

#[tokio::test]
async fn test_delivery_report_triggers_event() {
    let runner = runner().await;
    let ctx = runner.context();
    let (conv_key, batch_id) = started(&runner).await;
    let sent = outbound(ctx.bus());

    let ack = TransportEvent::ack(sent[0].message_id.clone(), "remote-1");
    assert!(runner.process_event(&ack).await.unwrap());
    // Acks are stored but not announced.
    assert!(app_events(ctx.bus()).is_empty());

    let report = TransportEvent::delivery_report(sent[0].message_id.clone(), DeliveryStatus::Delivered);
    assert!(runner.process_event(&report).await.unwrap());

    let events = app_events(ctx.bus());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "delivery_report");
    assert_eq!(events[0].conversation_key, conv_key);
    assert_eq!(events[0].content["status"], json!("delivered"));

    let status = message_store::batch_status(ctx.pool(), &batch_id).await.unwrap();
    assert_eq!(status.ack, 1);
    assert_eq!(status.delivery_report_delivered, 1);
}

#[tokio::test]
async fn test_event_for_unknown_message_is_dropped() {
    let runner = runner().await;
    let ctx = runner.context();

    let orphan = TransportEvent::ack("no-such-message", "remote-1");
    assert!(!runner.process_event(&orphan).await.unwrap());
    assert!(ctx.find_outbound_message_for_event(&orphan).await.unwrap().is_none());

    let mut missing_id = TransportEvent::nack("x", "failed");
    missing_id.user_message_id = None;
    assert!(!runner.process_event(&missing_id).await.unwrap());

    assert!(app_events(ctx.bus()).is_empty());
}

#[tokio::test]
async fn test_conversation_for_batch_fallbacks() {
    let runner = runner().await;
    let ctx = runner.context();
    let (conv_key, batch_id) = started(&runner).await;

    let found = ctx.conversation_for_batch(&batch_id, None).await.unwrap().unwrap();
    assert_eq!(found.key, conv_key);
    let found = ctx
        .conversation_for_batch(&batch_id, Some(&conv_key))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.key, conv_key);

    assert!(ctx.conversation_for_batch("missing", None).await.unwrap().is_none());

    // A batch without an owning account resolves to nothing.
    let orphan = message_store::batch_start(ctx.pool(), &[], &Default::default())
        .await
        .unwrap();
    assert!(ctx.conversation_for_batch(&orphan, None).await.unwrap().is_none());
    assert!(conversation::find_conversation_by_batch(ctx.pool(), &orphan)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_collect_metrics_counts_messages() {
    let runner = runner().await;
    let ctx = runner.context();
    let (conv_key, _) = started(&runner).await;

    let mut reply = UserMessage::new("+2783", "+2781", Some("hi".into()));
    reply.set_tag(&longcode());
    runner.process_user_message(&reply).await.unwrap();

    let outcome = runner.dispatch(&command("collect_metrics", &conv_key)).await;
    assert_eq!(outcome, CommandOutcome::Handled);
    ctx.metrics().flush().unwrap();

    let published = metrics(ctx.bus());
    let points: Vec<(String, f64)> = published[0]
        .datapoints
        .iter()
        .map(|d| (d.name.clone(), d.points[0].1))
        .collect();
    assert_eq!(
        points,
        vec![
            (format!("go.campaigns.{}.{}.messages_received", ACCOUNT, conv_key), 1.0),
            (format!("go.campaigns.{}.{}.messages_sent", ACCOUNT, conv_key), 2.0),
        ]
    );
}
