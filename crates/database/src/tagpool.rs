//! Tag pool manager.
//!
//! Tags are declared into named pools and handed out to accounts one at a
//! time. Acquisition is a single `UPDATE ... RETURNING` statement, so two
//! workers sharing the database can never claim the same tag. Tags are
//! handed out in declaration order.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DatabaseError, Result};
use crate::validation::{validate_pool_name, validate_tag_name};
use crate::Tag;

/// Declare tags, creating pools as needed.
///
/// Pairs that are already declared are ignored. Returns how many tags were
/// newly added.
pub async fn declare_tags(pool: &SqlitePool, tags: &[Tag]) -> Result<u64> {
    for tag in tags {
        validate_pool_name(&tag.pool)?;
        validate_tag_name(&tag.name)?;
    }

    let mut tx = pool.begin().await?;
    let mut added = 0;

    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO tag_pools (name) VALUES (?)")
            .bind(&tag.pool)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO tags (pool, tag)
            VALUES (?, ?)
            ON CONFLICT(pool, tag) DO NOTHING
            "#,
        )
        .bind(&tag.pool)
        .bind(&tag.name)
        .execute(&mut *tx)
        .await?;

        added += result.rows_affected();
    }

    tx.commit().await?;

    debug!(requested = tags.len(), added, "Declared tags");
    Ok(added)
}

/// Claim the earliest-declared free tag in `tag_pool` for `owner`.
///
/// Returns `None` when the pool is exhausted or unknown.
pub async fn acquire_tag(pool: &SqlitePool, tag_pool: &str, owner: &str) -> Result<Option<Tag>> {
    let claimed: Option<(String, String)> = sqlx::query_as(
        r#"
        UPDATE tags
        SET owner = ?, acquired_at = ?
        WHERE id = (
            SELECT id FROM tags
            WHERE pool = ? AND owner IS NULL
            ORDER BY id
            LIMIT 1
        )
        AND owner IS NULL
        RETURNING pool, tag
        "#,
    )
    .bind(owner)
    .bind(Utc::now())
    .bind(tag_pool)
    .fetch_optional(pool)
    .await?;

    match claimed {
        Some(row) => {
            let tag = Tag::from(row);
            debug!(tag = %tag, owner, "Acquired tag");
            Ok(Some(tag))
        }
        None => {
            debug!(pool = tag_pool, owner, "No free tags");
            Ok(None)
        }
    }
}

/// Claim a named tag for `owner`.
///
/// Fails with `TagAlreadyClaimed` if someone holds it (including `owner`)
/// and `NotFound` if it was never declared.
pub async fn acquire_specific_tag(pool: &SqlitePool, tag: &Tag, owner: &str) -> Result<Tag> {
    let result = sqlx::query(
        r#"
        UPDATE tags
        SET owner = ?, acquired_at = ?
        WHERE pool = ? AND tag = ? AND owner IS NULL
        "#,
    )
    .bind(owner)
    .bind(Utc::now())
    .bind(&tag.pool)
    .bind(&tag.name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        debug!(tag = %tag, owner, "Acquired specific tag");
        return Ok(tag.clone());
    }

    if tag_owner(pool, tag).await?.is_some() {
        Err(DatabaseError::TagAlreadyClaimed {
            tag: tag.to_string(),
        })
    } else {
        Err(DatabaseError::NotFound {
            entity: "Tag",
            id: tag.to_string(),
        })
    }
}

/// Return a tag to its pool.
///
/// Does nothing if `owner` does not hold the tag.
pub async fn release_tag(pool: &SqlitePool, tag: &Tag, owner: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE tags
        SET owner = NULL, acquired_at = NULL
        WHERE pool = ? AND tag = ? AND owner = ?
        "#,
    )
    .bind(&tag.pool)
    .bind(&tag.name)
    .bind(owner)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        debug!(tag = %tag, owner, "Release ignored, tag not held by owner");
    } else {
        debug!(tag = %tag, owner, "Released tag");
    }

    Ok(())
}

/// Current owner of a tag.
///
/// `Ok(None)` covers both free and undeclared tags; see [`is_declared`].
pub async fn tag_owner(pool: &SqlitePool, tag: &Tag) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT owner FROM tags WHERE pool = ? AND tag = ?")
            .bind(&tag.pool)
            .bind(&tag.name)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(owner,)| owner))
}

/// Whether a tag has been declared.
pub async fn is_declared(pool: &SqlitePool, tag: &Tag) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM tags WHERE pool = ? AND tag = ?")
        .bind(&tag.pool)
        .bind(&tag.name)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Pool metadata. Unknown pools have empty metadata.
pub async fn get_metadata(pool: &SqlitePool, tag_pool: &str) -> Result<Map<String, Value>> {
    let row: Option<(Json<Map<String, Value>>,)> =
        sqlx::query_as("SELECT metadata FROM tag_pools WHERE name = ?")
            .bind(tag_pool)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(Json(metadata),)| metadata).unwrap_or_default())
}

/// Replace a pool's metadata, creating the pool if needed.
pub async fn set_metadata(
    pool: &SqlitePool,
    tag_pool: &str,
    metadata: &Map<String, Value>,
) -> Result<()> {
    validate_pool_name(tag_pool)?;

    sqlx::query(
        r#"
        INSERT INTO tag_pools (name, metadata)
        VALUES (?, ?)
        ON CONFLICT(name) DO UPDATE SET metadata = excluded.metadata
        "#,
    )
    .bind(tag_pool)
    .bind(Json(metadata))
    .execute(pool)
    .await?;

    Ok(())
}

/// Names of all known pools.
pub async fn list_pools(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT name FROM tag_pools ORDER BY name")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Unclaimed tags in a pool, in acquisition order.
pub async fn free_tags(pool: &SqlitePool, tag_pool: &str) -> Result<Vec<Tag>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pool, tag FROM tags
        WHERE pool = ? AND owner IS NULL
        ORDER BY id
        "#,
    )
    .bind(tag_pool)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Tag::from).collect())
}

/// Claimed tags in a pool.
pub async fn inuse_tags(pool: &SqlitePool, tag_pool: &str) -> Result<Vec<Tag>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pool, tag FROM tags
        WHERE pool = ? AND owner IS NOT NULL
        ORDER BY id
        "#,
    )
    .bind(tag_pool)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Tag::from).collect())
}

/// Tags held by `owner` across all pools.
pub async fn owned_tags(pool: &SqlitePool, owner: &str) -> Result<Vec<Tag>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pool, tag FROM tags
        WHERE owner = ?
        ORDER BY id
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Tag::from).collect())
}

/// Number of tags `owner` holds in one pool.
pub async fn count_owned(pool: &SqlitePool, tag_pool: &str, owner: &str) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tags WHERE pool = ? AND owner = ?")
            .bind(tag_pool)
            .bind(owner)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Remove a pool and all its tags.
///
/// Refuses with `TagsInUse` while any tag is claimed.
pub async fn purge_pool(pool: &SqlitePool, tag_pool: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    let (in_use,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM tags WHERE pool = ? AND owner IS NOT NULL")
            .bind(tag_pool)
            .fetch_one(&mut *tx)
            .await?;

    if in_use > 0 {
        return Err(DatabaseError::TagsInUse {
            pool: tag_pool.to_string(),
            count: in_use,
        });
    }

    sqlx::query("DELETE FROM tags WHERE pool = ?")
        .bind(tag_pool)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tag_pools WHERE name = ?")
        .bind(tag_pool)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(pool = tag_pool, "Purged tag pool");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use serde_json::json;

    fn pool_a() -> Vec<Tag> {
        vec![Tag::new("poolA", "t1"), Tag::new("poolA", "t2")]
    }

    #[tokio::test]
    async fn test_acquire_release_order() {
        let db = Database::in_memory().await.unwrap();
        declare_tags(db.pool(), &pool_a()).await.unwrap();

        let first = acquire_tag(db.pool(), "poolA", "acc").await.unwrap();
        let second = acquire_tag(db.pool(), "poolA", "acc").await.unwrap();
        assert_eq!(first, Some(Tag::new("poolA", "t1")));
        assert_eq!(second, Some(Tag::new("poolA", "t2")));
        assert_eq!(acquire_tag(db.pool(), "poolA", "acc").await.unwrap(), None);

        release_tag(db.pool(), &Tag::new("poolA", "t1"), "acc")
            .await
            .unwrap();
        let again = acquire_tag(db.pool(), "poolA", "acc").await.unwrap();
        assert_eq!(again, Some(Tag::new("poolA", "t1")));
    }

    #[tokio::test]
    async fn test_exhaustion_after_n_acquisitions() {
        let db = Database::in_memory().await.unwrap();
        let tags: Vec<Tag> = (0..5)
            .map(|i| Tag::new("shortcode", format!("*120*{}#", i)))
            .collect();
        declare_tags(db.pool(), &tags).await.unwrap();

        for expected in &tags {
            let got = acquire_tag(db.pool(), "shortcode", "acc").await.unwrap();
            assert_eq!(got.as_ref(), Some(expected));
        }
        assert_eq!(acquire_tag(db.pool(), "shortcode", "acc").await.unwrap(), None);
        assert_eq!(owned_tags(db.pool(), "acc").await.unwrap(), tags);
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(declare_tags(db.pool(), &pool_a()).await.unwrap(), 2);
        assert_eq!(declare_tags(db.pool(), &pool_a()).await.unwrap(), 0);
        assert_eq!(free_tags(db.pool(), "poolA").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_pool_yields_none() {
        let db = Database::in_memory().await.unwrap();
        assert_eq!(acquire_tag(db.pool(), "nope", "acc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        declare_tags(db.pool(), &pool_a()).await.unwrap();
        let tag = acquire_tag(db.pool(), "poolA", "acc").await.unwrap().unwrap();

        release_tag(db.pool(), &tag, "someone-else").await.unwrap();
        assert_eq!(tag_owner(db.pool(), &tag).await.unwrap().as_deref(), Some("acc"));
        assert_eq!(inuse_tags(db.pool(), "poolA").await.unwrap(), vec![tag]);
    }

    #[tokio::test]
    async fn test_acquire_specific_tag() {
        let db = Database::in_memory().await.unwrap();
        declare_tags(db.pool(), &pool_a()).await.unwrap();
        let t2 = Tag::new("poolA", "t2");

        acquire_specific_tag(db.pool(), &t2, "acc").await.unwrap();
        assert!(matches!(
            acquire_specific_tag(db.pool(), &t2, "other").await,
            Err(DatabaseError::TagAlreadyClaimed { .. })
        ));
        assert!(matches!(
            acquire_specific_tag(db.pool(), &Tag::new("poolA", "t9"), "acc").await,
            Err(DatabaseError::NotFound { .. })
        ));

        // The generic claim skips the specifically claimed tag.
        let next = acquire_tag(db.pool(), "poolA", "other").await.unwrap();
        assert_eq!(next, Some(Tag::new("poolA", "t1")));
        assert_eq!(count_owned(db.pool(), "poolA", "acc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_metadata_replace() {
        let db = Database::in_memory().await.unwrap();
        assert!(get_metadata(db.pool(), "poolA").await.unwrap().is_empty());

        let first = json!({"transport_type": "sms", "user_selects_tag": true});
        set_metadata(db.pool(), "poolA", first.as_object().unwrap())
            .await
            .unwrap();
        let second = json!({"transport_type": "ussd"});
        set_metadata(db.pool(), "poolA", second.as_object().unwrap())
            .await
            .unwrap();

        let stored = get_metadata(db.pool(), "poolA").await.unwrap();
        assert_eq!(Value::Object(stored), second);
        assert_eq!(list_pools(db.pool()).await.unwrap(), vec!["poolA"]);
    }

    #[tokio::test]
    async fn test_purge_pool() {
        let db = Database::in_memory().await.unwrap();
        declare_tags(db.pool(), &pool_a()).await.unwrap();
        let tag = acquire_tag(db.pool(), "poolA", "acc").await.unwrap().unwrap();

        assert!(matches!(
            purge_pool(db.pool(), "poolA").await,
            Err(DatabaseError::TagsInUse { count: 1, .. })
        ));

        release_tag(db.pool(), &tag, "acc").await.unwrap();
        purge_pool(db.pool(), "poolA").await.unwrap();
        assert!(list_pools(db.pool()).await.unwrap().is_empty());
        assert!(!is_declared(db.pool(), &tag).await.unwrap());
    }
}
