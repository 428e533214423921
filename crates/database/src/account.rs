//! User account and tag pool permission operations.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{DatabaseError, Result};
use crate::models::{TagpoolPermission, UserAccount};
use crate::validation::validate_pool_name;

/// Create a new account.
pub async fn create_account(pool: &SqlitePool, key: &str, username: &str) -> Result<UserAccount> {
    let account = UserAccount {
        key: key.to_string(),
        username: username.to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO user_accounts (key, username, created_at)
        VALUES (?, ?, ?)
        "#,
    )
    .bind(&account.key)
    .bind(&account.username)
    .bind(account.created_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_unique_violation() {
                return DatabaseError::AlreadyExists {
                    entity: "UserAccount",
                    id: key.to_string(),
                };
            }
        }
        DatabaseError::Sqlx(e)
    })?;

    Ok(account)
}

/// Get an account by key.
pub async fn get_account(pool: &SqlitePool, key: &str) -> Result<UserAccount> {
    sqlx::query_as::<_, UserAccount>(
        r#"
        SELECT key, username, created_at
        FROM user_accounts
        WHERE key = ?
        "#,
    )
    .bind(key)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "UserAccount",
        id: key.to_string(),
    })
}

/// Check whether an account exists.
pub async fn account_exists(pool: &SqlitePool, key: &str) -> Result<bool> {
    let found: Option<(String,)> = sqlx::query_as("SELECT key FROM user_accounts WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Allow an account to draw tags from a pool, optionally capped at `max_keys`.
///
/// Granting again replaces the cap.
pub async fn add_tagpool_permission(
    pool: &SqlitePool,
    account_key: &str,
    tag_pool: &str,
    max_keys: Option<i64>,
) -> Result<()> {
    validate_pool_name(tag_pool)?;

    sqlx::query(
        r#"
        INSERT INTO tagpool_permissions (account_key, pool, max_keys)
        VALUES (?, ?, ?)
        ON CONFLICT(account_key, pool) DO UPDATE SET max_keys = excluded.max_keys
        "#,
    )
    .bind(account_key)
    .bind(tag_pool)
    .bind(max_keys)
    .execute(pool)
    .await
    .map_err(|e| {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.is_foreign_key_violation() {
                return DatabaseError::NotFound {
                    entity: "UserAccount",
                    id: account_key.to_string(),
                };
            }
        }
        DatabaseError::Sqlx(e)
    })?;

    Ok(())
}

/// Pools an account may draw from, ordered by pool name.
pub async fn tagpool_permissions(
    pool: &SqlitePool,
    account_key: &str,
) -> Result<Vec<TagpoolPermission>> {
    let permissions = sqlx::query_as::<_, TagpoolPermission>(
        r#"
        SELECT account_key, pool, max_keys
        FROM tagpool_permissions
        WHERE account_key = ?
        ORDER BY pool
        "#,
    )
    .bind(account_key)
    .fetch_all(pool)
    .await?;

    Ok(permissions)
}

/// Look up the permission for one pool.
pub async fn tagpool_permission(
    pool: &SqlitePool,
    account_key: &str,
    tag_pool: &str,
) -> Result<Option<TagpoolPermission>> {
    let permission = sqlx::query_as::<_, TagpoolPermission>(
        r#"
        SELECT account_key, pool, max_keys
        FROM tagpool_permissions
        WHERE account_key = ? AND pool = ?
        "#,
    )
    .bind(account_key)
    .bind(tag_pool)
    .fetch_optional(pool)
    .await?;

    Ok(permission)
}
