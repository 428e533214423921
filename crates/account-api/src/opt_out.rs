//! Opt-out store interface.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::ApiError;

/// Addresses that asked not to be contacted.
#[async_trait]
pub trait OptOutStore: Send + Sync {
    /// Whether `addr` (of kind `addr_type`, e.g. `msisdn`) opted out.
    async fn is_opted_out(
        &self,
        account_key: &str,
        addr_type: &str,
        addr: &str,
    ) -> Result<bool, ApiError>;

    /// Record an opt-out. `message_id` is the message that requested it.
    async fn opt_out(
        &self,
        account_key: &str,
        addr_type: &str,
        addr: &str,
        message_id: Option<&str>,
    ) -> Result<(), ApiError>;
}

/// In-memory opt-out store.
#[derive(Debug, Default)]
pub struct MemoryOptOutStore {
    opt_outs: RwLock<HashSet<(String, String, String)>>,
}

impl MemoryOptOutStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OptOutStore for MemoryOptOutStore {
    async fn is_opted_out(
        &self,
        account_key: &str,
        addr_type: &str,
        addr: &str,
    ) -> Result<bool, ApiError> {
        let key = (
            account_key.to_string(),
            addr_type.to_string(),
            addr.to_string(),
        );
        Ok(self.opt_outs.read().await.contains(&key))
    }

    async fn opt_out(
        &self,
        account_key: &str,
        addr_type: &str,
        addr: &str,
        message_id: Option<&str>,
    ) -> Result<(), ApiError> {
        self.opt_outs.write().await.insert((
            account_key.to_string(),
            addr_type.to_string(),
            addr.to_string(),
        ));
        info!(account_key, addr_type, addr, ?message_id, "Opt-out recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opt_out_membership() {
        let store = MemoryOptOutStore::new();
        assert!(!store.is_opted_out("acc", "msisdn", "+27").await.unwrap());

        store
            .opt_out("acc", "msisdn", "+27", Some("the-message-id"))
            .await
            .unwrap();
        assert!(store.is_opted_out("acc", "msisdn", "+27").await.unwrap());
        assert!(!store.is_opted_out("other", "msisdn", "+27").await.unwrap());
    }
}
