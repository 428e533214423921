//! Contact store interface.

use std::collections::HashMap;

use async_trait::async_trait;
use database::Conversation;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ApiError;

/// A person messages can be sent to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub key: String,
    pub name: Option<String>,
    pub msisdn: Option<String>,
    pub gtalk_id: Option<String>,
    /// Contact group keys.
    pub groups: Vec<String>,
}

impl Contact {
    /// A contact reachable by phone number.
    pub fn with_msisdn(key: impl Into<String>, msisdn: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            msisdn: Some(msisdn.into()),
            gtalk_id: None,
            groups: Vec::new(),
        }
    }

    /// Add the contact to a group.
    pub fn in_group(mut self, group_key: impl Into<String>) -> Self {
        self.groups.push(group_key.into());
        self
    }

    /// Address field used for a delivery class.
    pub fn addr_type_for(delivery_class: &str) -> Option<&'static str> {
        match delivery_class {
            "sms" | "ussd" => Some("msisdn"),
            "gtalk" => Some("gtalk_id"),
            _ => None,
        }
    }

    /// The contact's address for a delivery class, if it has one.
    pub fn addr_for(&self, delivery_class: &str) -> Option<&str> {
        match Self::addr_type_for(delivery_class)? {
            "msisdn" => self.msisdn.as_deref(),
            _ => self.gtalk_id.as_deref(),
        }
    }
}

/// Lookup of contacts and contact groups.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Find the contact with `addr` for a delivery class.
    async fn contact_for_addr(
        &self,
        account_key: &str,
        delivery_class: &str,
        addr: &str,
    ) -> Result<Option<Contact>, ApiError>;

    /// Every contact in any of the conversation's groups, without duplicates.
    async fn get_contacts_for_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<Contact>, ApiError>;
}

/// In-memory contact store.
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    contacts: RwLock<HashMap<String, Vec<Contact>>>,
}

impl MemoryContactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact to an account.
    pub async fn add_contact(&self, account_key: &str, contact: Contact) {
        self.contacts
            .write()
            .await
            .entry(account_key.to_string())
            .or_default()
            .push(contact);
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn contact_for_addr(
        &self,
        account_key: &str,
        delivery_class: &str,
        addr: &str,
    ) -> Result<Option<Contact>, ApiError> {
        let contacts = self.contacts.read().await;
        Ok(contacts.get(account_key).and_then(|contacts| {
            contacts
                .iter()
                .find(|c| c.addr_for(delivery_class) == Some(addr))
                .cloned()
        }))
    }

    async fn get_contacts_for_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<Contact>, ApiError> {
        let contacts = self.contacts.read().await;
        Ok(contacts
            .get(&conversation.account_key)
            .map(|contacts| {
                contacts
                    .iter()
                    .filter(|c| c.groups.iter().any(|g| conversation.groups.contains(g)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
