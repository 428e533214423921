//! Conversation store.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::models::{Conversation, NewConversation};
use crate::validation::{validate_conversation_type, validate_subject};

#[derive(Debug, FromRow)]
struct ConversationRow {
    key: String,
    account_key: String,
    conversation_type: String,
    subject: String,
    message: String,
    delivery_class: Option<String>,
    delivery_tag_pool: Option<String>,
    delivery_tag: Option<String>,
    start_timestamp: DateTime<Utc>,
    end_timestamp: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    metadata: Json<Map<String, Value>>,
}

const SELECT_CONVERSATION: &str = r#"
    SELECT key, account_key, conversation_type, subject, message, delivery_class,
           delivery_tag_pool, delivery_tag, start_timestamp, end_timestamp,
           created_at, metadata
    FROM conversations
"#;

async fn assemble(pool: &SqlitePool, row: ConversationRow) -> Result<Conversation> {
    let groups: Vec<(String,)> = sqlx::query_as(
        "SELECT group_key FROM conversation_groups WHERE conversation_key = ? ORDER BY group_key",
    )
    .bind(&row.key)
    .fetch_all(pool)
    .await?;

    let batches: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT batch_id FROM conversation_batches
        WHERE conversation_key = ?
        ORDER BY added_at, rowid
        "#,
    )
    .bind(&row.key)
    .fetch_all(pool)
    .await?;

    Ok(Conversation {
        key: row.key,
        account_key: row.account_key,
        conversation_type: row.conversation_type,
        subject: row.subject,
        message: row.message,
        delivery_class: row.delivery_class,
        delivery_tag_pool: row.delivery_tag_pool,
        delivery_tag: row.delivery_tag,
        start_timestamp: row.start_timestamp,
        end_timestamp: row.end_timestamp,
        created_at: row.created_at,
        metadata: row.metadata.0,
        groups: groups.into_iter().map(|(g,)| g).collect(),
        batches: batches.into_iter().map(|(b,)| b).collect(),
    })
}

/// Create a draft conversation for an account.
pub async fn new_conversation(
    pool: &SqlitePool,
    account_key: &str,
    new: &NewConversation,
) -> Result<Conversation> {
    validate_conversation_type(&new.conversation_type)?;
    validate_subject(&new.subject)?;

    let key = Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO conversations (
            key, account_key, conversation_type, subject, message, delivery_class,
            delivery_tag_pool, delivery_tag, start_timestamp, created_at, metadata
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&key)
    .bind(account_key)
    .bind(&new.conversation_type)
    .bind(&new.subject)
    .bind(&new.message)
    .bind(&new.delivery_class)
    .bind(&new.delivery_tag_pool)
    .bind(&new.delivery_tag)
    .bind(new.start_timestamp.unwrap_or(now))
    .bind(now)
    .bind(Json(&new.metadata))
    .execute(&mut *tx)
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

    for group_key in &new.groups {
        sqlx::query(
            r#"
            INSERT INTO conversation_groups (conversation_key, group_key)
            VALUES (?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(group_key)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        conversation_key = %key,
        account_key,
        conversation_type = %new.conversation_type,
        "Created conversation"
    );

    load_conversation(pool, &key)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "Conversation",
            id: key,
        })
}

/// Load a conversation owned by `account_key`.
pub async fn get_conversation(
    pool: &SqlitePool,
    account_key: &str,
    key: &str,
) -> Result<Option<Conversation>> {
    let query = format!("{} WHERE key = ? AND account_key = ?", SELECT_CONVERSATION);
    let row = sqlx::query_as::<_, ConversationRow>(&query)
        .bind(key)
        .bind(account_key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(assemble(pool, row).await?)),
        None => Ok(None),
    }
}

/// Load a conversation regardless of owner.
pub async fn load_conversation(pool: &SqlitePool, key: &str) -> Result<Option<Conversation>> {
    let query = format!("{} WHERE key = ?", SELECT_CONVERSATION);
    let row = sqlx::query_as::<_, ConversationRow>(&query)
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(assemble(pool, row).await?)),
        None => Ok(None),
    }
}

/// All conversations of an account, oldest first.
pub async fn list_conversations(pool: &SqlitePool, account_key: &str) -> Result<Vec<Conversation>> {
    let query = format!(
        "{} WHERE account_key = ? ORDER BY created_at, key",
        SELECT_CONVERSATION
    );
    let rows = sqlx::query_as::<_, ConversationRow>(&query)
        .bind(account_key)
        .fetch_all(pool)
        .await?;

    let mut conversations = Vec::with_capacity(rows.len());
    for row in rows {
        conversations.push(assemble(pool, row).await?);
    }
    Ok(conversations)
}

/// Save the editable fields of a conversation.
///
/// Groups, batches and timestamps have their own operations and are left
/// untouched.
pub async fn update_conversation(pool: &SqlitePool, conversation: &Conversation) -> Result<()> {
    validate_subject(&conversation.subject)?;

    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET subject = ?, message = ?, delivery_class = ?, delivery_tag_pool = ?,
            delivery_tag = ?, metadata = ?
        WHERE key = ?
        "#,
    )
    .bind(&conversation.subject)
    .bind(&conversation.message)
    .bind(&conversation.delivery_class)
    .bind(&conversation.delivery_tag_pool)
    .bind(&conversation.delivery_tag)
    .bind(Json(&conversation.metadata))
    .bind(&conversation.key)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound {
            entity: "Conversation",
            id: conversation.key.clone(),
        });
    }

    Ok(())
}

fn map_conversation_fk(e: sqlx::Error, key: &str) -> DatabaseError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_foreign_key_violation() {
            return DatabaseError::NotFound {
                entity: "Conversation",
                id: key.to_string(),
            };
        }
    }
    DatabaseError::Sqlx(e)
}

/// Add a contact group to a conversation.
pub async fn add_group(pool: &SqlitePool, key: &str, group_key: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conversation_groups (conversation_key, group_key)
        VALUES (?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(key)
    .bind(group_key)
    .execute(pool)
    .await
    .map_err(|e| map_conversation_fk(e, key))?;

    Ok(())
}

/// Attach a batch to a conversation, marking it started.
pub async fn add_batch(pool: &SqlitePool, key: &str, batch_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conversation_batches (conversation_key, batch_id, added_at)
        VALUES (?, ?, ?)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(key)
    .bind(batch_id)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| map_conversation_fk(e, key))?;

    info!(conversation_key = key, batch_id, "Batch added to conversation");
    Ok(())
}

/// Set the end timestamp.
///
/// Returns `false` if the conversation had already ended.
pub async fn set_end_timestamp(pool: &SqlitePool, key: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE conversations SET end_timestamp = ? WHERE key = ? AND end_timestamp IS NULL",
    )
    .bind(Utc::now())
    .bind(key)
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(true);
    }

    match load_conversation(pool, key).await? {
        Some(_) => Ok(false),
        None => Err(DatabaseError::NotFound {
            entity: "Conversation",
            id: key.to_string(),
        }),
    }
}

/// The conversation a batch belongs to.
pub async fn find_conversation_by_batch(
    pool: &SqlitePool,
    batch_id: &str,
) -> Result<Option<Conversation>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT conversation_key FROM conversation_batches WHERE batch_id = ? LIMIT 1",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((key,)) => load_conversation(pool, &key).await,
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConversationStatus;
    use crate::{account, message_store, Database};

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        account::create_account(db.pool(), "acc-1", "Buster").await.unwrap();
        db
    }

    fn bulk() -> NewConversation {
        NewConversation::new("bulk_message", "Launch", "Hello!")
            .with_delivery_class("sms")
            .with_delivery_pool("longcode")
            .with_group("group-1")
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = setup().await;
        let created = new_conversation(db.pool(), "acc-1", &bulk()).await.unwrap();
        assert_eq!(created.key.len(), 32);
        assert_eq!(created.status(), ConversationStatus::Draft);
        assert_eq!(created.groups, vec!["group-1"]);

        let fetched = get_conversation(db.pool(), "acc-1", &created.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);

        assert!(get_conversation(db.pool(), "other", &created.key)
            .await
            .unwrap()
            .is_none());
        assert_eq!(list_conversations(db.pool(), "acc-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_type_and_unknown_account() {
        let db = setup().await;
        let bad = NewConversation::new("Bulk Message", "s", "m");
        assert!(matches!(
            new_conversation(db.pool(), "acc-1", &bad).await,
            Err(DatabaseError::Validation(_))
        ));
        assert!(matches!(
            new_conversation(db.pool(), "ghost", &bulk()).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let db = setup().await;
        let conv = new_conversation(db.pool(), "acc-1", &bulk()).await.unwrap();

        let batch_id = message_store::batch_start(db.pool(), &[], &Map::new())
            .await
            .unwrap();
        add_batch(db.pool(), &conv.key, &batch_id).await.unwrap();

        let running = load_conversation(db.pool(), &conv.key).await.unwrap().unwrap();
        assert_eq!(running.status(), ConversationStatus::Running);
        assert_eq!(running.batches, vec![batch_id.clone()]);

        let by_batch = find_conversation_by_batch(db.pool(), &batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_batch.key, conv.key);

        assert!(set_end_timestamp(db.pool(), &conv.key).await.unwrap());
        assert!(!set_end_timestamp(db.pool(), &conv.key).await.unwrap());
        let finished = load_conversation(db.pool(), &conv.key).await.unwrap().unwrap();
        assert_eq!(finished.status(), ConversationStatus::Finished);

        assert!(matches!(
            set_end_timestamp(db.pool(), "missing").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let db = setup().await;
        let mut conv = new_conversation(db.pool(), "acc-1", &bulk()).await.unwrap();
        conv.subject = "Renamed".into();
        conv.metadata
            .insert("survey".into(), serde_json::json!({"questions": 3}));
        update_conversation(db.pool(), &conv).await.unwrap();
        add_group(db.pool(), &conv.key, "group-2").await.unwrap();

        let fetched = load_conversation(db.pool(), &conv.key).await.unwrap().unwrap();
        assert_eq!(fetched.subject, "Renamed");
        assert_eq!(fetched.metadata, conv.metadata);
        assert_eq!(fetched.groups, vec!["group-1", "group-2"]);
    }
}
