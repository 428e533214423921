//! Poll links stored in conversation metadata under `vxpolls.polls`.
//!
//! These only edit the in-memory conversation; save it with
//! [`UserApi::save_conversation`](crate::UserApi::save_conversation).

use database::Conversation;
use serde_json::{Map, Value};

const POLLS_NAMESPACE: &str = "vxpolls";
const POLLS_KEY: &str = "polls";

fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    }
}

fn with_polls<R>(conversation: &mut Conversation, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
    let mut namespace = take_object(&mut conversation.metadata, POLLS_NAMESPACE);
    let mut polls = take_object(&mut namespace, POLLS_KEY);
    let result = f(&mut polls);
    namespace.insert(POLLS_KEY.to_string(), Value::Object(polls));
    conversation
        .metadata
        .insert(POLLS_NAMESPACE.to_string(), Value::Object(namespace));
    result
}

/// Id for a poll owned by a conversation.
pub fn generate_poll_id(conversation: &Conversation, suffix: &str) -> String {
    format!("poll-{}_{}", conversation.key, suffix)
}

/// Link `poll_id` under `poll_name`, replacing any previous link.
pub fn link_poll_to_conversation(conversation: &mut Conversation, poll_name: &str, poll_id: &str) {
    with_polls(conversation, |polls| {
        polls.insert(poll_name.to_string(), Value::String(poll_id.to_string()));
    });
}

/// Remove a poll link, returning the poll id it pointed at.
pub fn unlink_poll_from_conversation(
    conversation: &mut Conversation,
    poll_name: &str,
) -> Option<String> {
    with_polls(conversation, |polls| match polls.remove(poll_name)? {
        Value::String(poll_id) => Some(poll_id),
        _ => None,
    })
}

/// Poll name to poll id for every linked poll.
pub fn get_polls_for_conversation(conversation: &Conversation) -> Vec<(String, String)> {
    conversation
        .metadata
        .get(POLLS_NAMESPACE)
        .and_then(|namespace| namespace.get(POLLS_KEY))
        .and_then(Value::as_object)
        .map(|polls| {
            polls
                .iter()
                .filter_map(|(name, id)| Some((name.clone(), id.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
