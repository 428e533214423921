//! SQLite persistence layer for the campaign workers.
//!
//! This crate provides async database operations for accounts, tag pools,
//! the message store (batches, messages, events, cached counters),
//! conversations and the durable queues shared by worker processes, using
//! SQLx with SQLite.
//!
//! # Example
//!
//! ```no_run
//! use database::{account, tagpool, Database, Tag};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("sqlite:campaign.db?mode=rwc").await?;
//!     db.migrate().await?;
//!
//!     // Declare sender addresses and hand one to an account
//!     account::create_account(db.pool(), "acc-1", "Buster").await?;
//!     tagpool::declare_tags(db.pool(), &[Tag::new("longcode", "+27831234567")]).await?;
//!     let tag = tagpool::acquire_tag(db.pool(), "longcode", "acc-1").await?;
//!     println!("acquired {:?}", tag);
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod conversation;
pub mod error;
pub mod message_store;
pub mod models;
pub mod queue;
pub mod tagpool;
pub mod validation;

pub use error::{DatabaseError, Result};
pub use message_bus::Tag;
pub use models::{
    Batch, BatchStatus, CachedCounts, Conversation, ConversationStatus, NewConversation,
    TagInfo, TagpoolPermission, UserAccount,
};
pub use validation::ValidationError;

pub use sqlx::SqlitePool;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Shared handle to the campaign store's connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Sized for the command handlers one worker runs concurrently.
    const DEFAULT_POOL_SIZE: u32 = 20;

    /// How long a query waits for a pooled connection.
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

    /// How long a writer waits for another connection's write lock.
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open the store at `url`, e.g. `sqlite:data/campaign.db?mode=rwc`.
    ///
    /// The file is created when missing. Call [`migrate`](Self::migrate)
    /// before first use.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example() -> database::Result<()> {
    /// let db = database::Database::connect("sqlite:data/campaign.db?mode=rwc").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_pool_size(url, Self::DEFAULT_POOL_SIZE).await
    }

    /// Like [`connect`](Self::connect) with an explicit pool size.
    ///
    /// Several workers may share one database file; writers wait for the
    /// write lock instead of failing with `SQLITE_BUSY`.
    pub async fn connect_with_pool_size(url: &str, pool_size: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Self::BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        tracing::info!(url, pool_size, "Connected to database");

        Ok(Self { pool })
    }

    /// Open a migrated in-memory database.
    ///
    /// Uses a single connection so every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::connect_with_pool_size("sqlite::memory:", 1).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Apply the embedded migrations. Safe to call on an up-to-date schema.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::debug!("Database schema up to date");
        Ok(())
    }

    /// Pool handed to the query modules.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_account_crud() {
        let db = Database::in_memory().await.unwrap();

        account::create_account(db.pool(), "acc-1", "Buster").await.unwrap();
        let fetched = account::get_account(db.pool(), "acc-1").await.unwrap();
        assert_eq!(fetched.username, "Buster");

        assert!(account::account_exists(db.pool(), "acc-1").await.unwrap());
        assert!(!account::account_exists(db.pool(), "foo").await.unwrap());

        let result = account::create_account(db.pool(), "acc-1", "Again").await;
        assert!(matches!(result, Err(DatabaseError::AlreadyExists { .. })));

        let result = account::get_account(db.pool(), "missing").await;
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_migrate_is_repeatable() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
    }
}
