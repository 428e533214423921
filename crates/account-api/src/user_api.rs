//! Per-account API.

use std::collections::BTreeSet;

use database::{
    account, conversation, tagpool, Conversation, DatabaseError, NewConversation, Tag,
    TagpoolPermission, UserAccount,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::api::CampaignApi;
use crate::contact::Contact;
use crate::error::{ApiError, Result};
use crate::msg_options::{msg_options, PoolMetadata};

/// Suffix of the worker name that runs a conversation type.
pub const APPLICATION_WORKER_SUFFIX: &str = "_application";

/// Worker that runs conversations of `conversation_type`.
pub fn application_worker_name(conversation_type: &str) -> String {
    format!("{}{}", conversation_type, APPLICATION_WORKER_SUFFIX)
}

/// The API as seen by one account.
#[derive(Clone)]
pub struct UserApi {
    api: CampaignApi,
    account_key: String,
}

impl UserApi {
    /// Bind `api` to an account.
    pub fn new(api: CampaignApi, account_key: impl Into<String>) -> Self {
        Self {
            api,
            account_key: account_key.into(),
        }
    }

    pub fn account_key(&self) -> &str {
        &self.account_key
    }

    pub fn api(&self) -> &CampaignApi {
        &self.api
    }

    /// Whether the account exists.
    pub async fn exists(&self) -> Result<bool> {
        self.api.user_exists(&self.account_key).await
    }

    /// Load the account record.
    pub async fn get_user_account(&self) -> Result<UserAccount> {
        Ok(account::get_account(self.api.pool(), &self.account_key).await?)
    }

    /// Create a draft conversation.
    pub async fn new_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        Ok(conversation::new_conversation(self.api.pool(), &self.account_key, new).await?)
    }

    /// Load one of the account's conversations.
    pub async fn get_conversation(&self, key: &str) -> Result<Option<Conversation>> {
        Ok(conversation::get_conversation(self.api.pool(), &self.account_key, key).await?)
    }

    /// All of the account's conversations.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(conversation::list_conversations(self.api.pool(), &self.account_key).await?)
    }

    /// Conversations that have not finished.
    pub async fn active_conversations(&self) -> Result<Vec<Conversation>> {
        let mut conversations = self.list_conversations().await?;
        conversations.retain(|conv| !conv.ended());
        Ok(conversations)
    }

    /// Persist edits to a conversation's fields and metadata.
    pub async fn save_conversation(&self, conv: &Conversation) -> Result<()> {
        self.require_owned(conv)?;
        Ok(conversation::update_conversation(self.api.pool(), conv).await?)
    }

    fn require_owned(&self, conv: &Conversation) -> Result<()> {
        if conv.account_key != self.account_key {
            return Err(ApiError::ConversationNotFound {
                key: conv.key.clone(),
            });
        }
        Ok(())
    }

    async fn require_conversation(&self, key: &str) -> Result<Conversation> {
        self.get_conversation(key)
            .await?
            .ok_or_else(|| ApiError::ConversationNotFound {
                key: key.to_string(),
            })
    }

    /// Pools the account may draw tags from.
    pub async fn tagpools(&self) -> Result<Vec<TagpoolPermission>> {
        Ok(account::tagpool_permissions(self.api.pool(), &self.account_key).await?)
    }

    /// Stored metadata for a pool.
    pub async fn pool_metadata(&self, pool: &str) -> Result<PoolMetadata> {
        let stored = tagpool::get_metadata(self.api.pool(), pool).await?;
        PoolMetadata::from_map(stored)
            .map_err(|e| ApiError::Database(DatabaseError::Json(e)))
    }

    /// Acquire the next free tag from a pool.
    ///
    /// Returns `None` if the pool is exhausted, the account may not use it,
    /// or the account already holds its `max_keys` allowance.
    pub async fn acquire_tag(&self, pool: &str) -> Result<Option<Tag>> {
        let permission =
            account::tagpool_permission(self.api.pool(), &self.account_key, pool).await?;
        let Some(permission) = permission else {
            debug!(account_key = %self.account_key, pool, "Pool not permitted");
            return Ok(None);
        };

        if let Some(max_keys) = permission.max_keys {
            let held = tagpool::count_owned(self.api.pool(), pool, &self.account_key).await?;
            if held >= max_keys {
                debug!(account_key = %self.account_key, pool, held, max_keys, "Tag allowance used up");
                return Ok(None);
            }
        }

        Ok(tagpool::acquire_tag(self.api.pool(), pool, &self.account_key).await?)
    }

    /// Acquire a named tag.
    pub async fn acquire_specific_tag(&self, tag: &Tag) -> Result<Tag> {
        Ok(tagpool::acquire_specific_tag(self.api.pool(), tag, &self.account_key).await?)
    }

    /// Release a tag held by the account.
    pub async fn release_tag(&self, tag: &Tag) -> Result<()> {
        Ok(tagpool::release_tag(self.api.pool(), tag, &self.account_key).await?)
    }

    /// Tags the account holds.
    pub async fn list_endpoints(&self) -> Result<BTreeSet<Tag>> {
        let tags = tagpool::owned_tags(self.api.pool(), &self.account_key).await?;
        Ok(tags.into_iter().collect())
    }

    /// Tags configured on or in use by unfinished conversations.
    pub async fn list_conversation_endpoints(&self) -> Result<BTreeSet<Tag>> {
        let mut endpoints = BTreeSet::new();
        for conv in self.active_conversations().await? {
            if let Some(tag) = conv.delivery_tag() {
                endpoints.insert(tag);
            }
            for batch_id in &conv.batches {
                endpoints.extend(self.api.batch_tags(batch_id).await?);
            }
        }
        Ok(endpoints)
    }

    /// Options for messages sent from `tag`.
    ///
    /// Uses the stored pool metadata unless `pool_metadata` is given.
    pub async fn msg_options(
        &self,
        tag: &Tag,
        pool_metadata: Option<&PoolMetadata>,
    ) -> Result<Map<String, Value>> {
        let options = match pool_metadata {
            Some(pool) => msg_options(&self.account_key, tag, pool),
            None => {
                let pool = self.pool_metadata(&tag.pool).await?;
                msg_options(&self.account_key, tag, &pool)
            }
        };
        Ok(options)
    }

    /// Contacts in the conversation's groups that have not opted out.
    pub async fn opted_in_contacts(&self, conv: &Conversation) -> Result<Vec<Contact>> {
        self.require_owned(conv)?;
        let delivery_class = conv.delivery_class.as_deref().unwrap_or("sms");
        let addr_type = Contact::addr_type_for(delivery_class);

        let contacts = self
            .api
            .contact_store()
            .get_contacts_for_conversation(conv)
            .await?;

        let mut opted_in = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let (Some(addr_type), Some(addr)) = (addr_type, contact.addr_for(delivery_class))
            else {
                continue;
            };
            let opted_out = self
                .api
                .opt_out_store()
                .is_opted_out(&self.account_key, addr_type, addr)
                .await?;
            if !opted_out {
                opted_in.push(contact);
            }
        }
        Ok(opted_in)
    }

    /// Claim the tag a conversation sends from.
    ///
    /// Returns the tag and whether it was newly claimed here.
    async fn acquire_conversation_tag(&self, conv: &Conversation, pool: &str) -> Result<(Tag, bool)> {
        let no_spare = || ApiError::NoSpareTags {
            pool: pool.to_string(),
        };

        match conv.delivery_tag() {
            Some(tag) => {
                let owner = tagpool::tag_owner(self.api.pool(), &tag).await?;
                if owner.as_deref() == Some(self.account_key.as_str()) {
                    return Ok((tag, false));
                }
                match tagpool::acquire_specific_tag(self.api.pool(), &tag, &self.account_key).await {
                    Ok(tag) => Ok((tag, true)),
                    Err(DatabaseError::TagAlreadyClaimed { .. } | DatabaseError::NotFound { .. }) => {
                        Err(no_spare())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            None => match self.acquire_tag(pool).await? {
                Some(tag) => Ok((tag, true)),
                None => Err(no_spare()),
            },
        }
    }

    /// Start a conversation.
    ///
    /// Acquires a tag, opens a batch, attaches it to the conversation and
    /// sends `start` to the conversation type's application worker. Returns
    /// the batch id. A conversation whose pool has no free tags stays in
    /// draft with no batch.
    pub async fn start_conversation(&self, key: &str) -> Result<String> {
        let conv = self.require_conversation(key).await?;
        if conv.ended() {
            return Err(ApiError::ConversationFinished { key: conv.key });
        }
        if conv.started() {
            return Err(ApiError::ConversationAlreadyStarted { key: conv.key });
        }

        let pool = conv
            .delivery_tag_pool
            .clone()
            .ok_or_else(|| ApiError::NoDeliveryPool {
                key: conv.key.clone(),
            })?;
        let pool_metadata = self.pool_metadata(&pool).await?;
        let is_client_initiated = pool_metadata.client_initiated;

        if !is_client_initiated && conv.groups.is_empty() {
            return Err(ApiError::NoContactGroups { key: conv.key });
        }

        let (tag, newly_acquired) = self.acquire_conversation_tag(&conv, &pool).await?;

        let mut batch_metadata = Map::new();
        batch_metadata.insert(
            "user_account".to_string(),
            Value::String(self.account_key.clone()),
        );

        let batch_id = match self.api.batch_start(std::slice::from_ref(&tag), &batch_metadata).await {
            Ok(batch_id) => batch_id,
            Err(e) => {
                if newly_acquired {
                    if let Err(release_err) = self.release_tag(&tag).await {
                        warn!(tag = %tag, error = %release_err, "Failed to release tag after batch error");
                    }
                }
                return Err(match e {
                    ApiError::Database(DatabaseError::TagInUse { .. }) => ApiError::NoSpareTags { pool },
                    other => other,
                });
            }
        };

        conversation::add_batch(self.api.pool(), &conv.key, &batch_id).await?;

        let options = msg_options(&self.account_key, &tag, &pool_metadata);

        let mut kwargs = Map::new();
        kwargs.insert("batch_id".to_string(), Value::String(batch_id.clone()));
        kwargs.insert("msg_options".to_string(), Value::Object(options));
        kwargs.insert(
            "is_client_initiated".to_string(),
            Value::Bool(is_client_initiated),
        );
        kwargs.insert("conversation_key".to_string(), Value::String(conv.key.clone()));
        kwargs.insert(
            "user_account_key".to_string(),
            Value::String(self.account_key.clone()),
        );

        let worker_name = application_worker_name(&conv.conversation_type);
        self.api.send_command(&worker_name, "start", kwargs)?;

        info!(
            conversation_key = %conv.key,
            account_key = %self.account_key,
            batch_id = %batch_id,
            tag = %tag,
            worker_name = %worker_name,
            "Conversation started"
        );

        Ok(batch_id)
    }

    /// End a conversation.
    ///
    /// Closes every batch and releases the batch tags, then sets the end
    /// timestamp. A failure part way leaves the conversation running so the
    /// call can be repeated. Ending twice fails with `ConversationFinished`.
    pub async fn end_conversation(&self, key: &str) -> Result<()> {
        let conv = self.require_conversation(key).await?;
        if conv.ended() {
            return Err(ApiError::ConversationFinished { key: conv.key });
        }

        for batch_id in &conv.batches {
            let tags = self.api.batch_tags(batch_id).await?;
            self.api.batch_done(batch_id).await?;
            for tag in tags {
                if let Err(e) = self.release_tag(&tag).await {
                    warn!(tag = %tag, batch_id = %batch_id, error = %e, "Failed to release tag");
                }
            }
        }

        if !conversation::set_end_timestamp(self.api.pool(), &conv.key).await? {
            return Err(ApiError::ConversationFinished { key: conv.key });
        }

        info!(
            conversation_key = %conv.key,
            account_key = %self.account_key,
            batches = conv.batches.len(),
            "Conversation ended"
        );
        Ok(())
    }
}
