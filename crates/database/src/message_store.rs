//! Message store: batches, messages, transport events and cached counters.
//!
//! A batch groups the messages sent and received under a set of tags while
//! a conversation runs. Each tag points at its current open batch so that
//! inbound traffic can be attributed without routing metadata.
//!
//! `batch_counters` is a cache maintained on every insert. The message
//! tables stay authoritative; [`needs_reconciliation`] and
//! [`reconcile_cache`] bring the cache back in line after drift.

use chrono::Utc;
use message_bus::{DeliveryStatus, EventType, TransportEvent, UserMessage};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Result};
use crate::models::{Batch, BatchStatus, CachedCounts, TagInfo};
use crate::Tag;

/// Default relative drift tolerated before counters are rebuilt.
pub const DEFAULT_RECONCILIATION_DELTA: f64 = 0.01;

/// Open a batch over `tags` and make it their current batch.
///
/// Fails with `TagInUse` if any tag is already bound to an open batch.
pub async fn batch_start(
    pool: &SqlitePool,
    tags: &[Tag],
    metadata: &Map<String, Value>,
) -> Result<String> {
    let mut tx = pool.begin().await?;

    for tag in tags {
        let open: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT ct.current_batch
            FROM current_tags ct
            JOIN batches b ON b.batch_id = ct.current_batch
            WHERE ct.pool = ? AND ct.tag = ? AND b.closed_at IS NULL
            "#,
        )
        .bind(&tag.pool)
        .bind(&tag.name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((batch_id,)) = open {
            return Err(DatabaseError::TagInUse {
                tag: tag.to_string(),
                batch_id,
            });
        }
    }

    let batch_id = Uuid::new_v4().simple().to_string();

    sqlx::query("INSERT INTO batches (batch_id, metadata, created_at) VALUES (?, ?, ?)")
        .bind(&batch_id)
        .bind(Json(metadata))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

    sqlx::query("INSERT INTO batch_counters (batch_id) VALUES (?)")
        .bind(&batch_id)
        .execute(&mut *tx)
        .await?;

    for (position, tag) in tags.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO batch_tags (batch_id, position, pool, tag)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(batch_id, pool, tag) DO NOTHING
            "#,
        )
        .bind(&batch_id)
        .bind(position as i64)
        .bind(&tag.pool)
        .bind(&tag.name)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO current_tags (pool, tag, current_batch)
            VALUES (?, ?, ?)
            ON CONFLICT(pool, tag) DO UPDATE SET current_batch = excluded.current_batch
            "#,
        )
        .bind(&tag.pool)
        .bind(&tag.name)
        .bind(&batch_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(batch_id = %batch_id, tags = tags.len(), "Batch started");
    Ok(batch_id)
}

/// Close a batch and unbind its tags. Closing twice is harmless.
pub async fn batch_done(pool: &SqlitePool, batch_id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    ensure_batch(&mut tx, batch_id).await?;

    let unbound = sqlx::query("UPDATE current_tags SET current_batch = NULL WHERE current_batch = ?")
        .bind(batch_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("UPDATE batches SET closed_at = ? WHERE batch_id = ? AND closed_at IS NULL")
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(batch_id, unbound, "Batch done");
    Ok(())
}

async fn ensure_batch(tx: &mut Transaction<'_, Sqlite>, batch_id: &str) -> Result<()> {
    let found: Option<(String,)> = sqlx::query_as("SELECT batch_id FROM batches WHERE batch_id = ?")
        .bind(batch_id)
        .fetch_optional(&mut **tx)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(DatabaseError::NotFound {
            entity: "Batch",
            id: batch_id.to_string(),
        }),
    }
}

/// Load a batch.
pub async fn get_batch(pool: &SqlitePool, batch_id: &str) -> Result<Batch> {
    sqlx::query_as::<_, Batch>(
        r#"
        SELECT batch_id, metadata, created_at, closed_at
        FROM batches
        WHERE batch_id = ?
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "Batch",
        id: batch_id.to_string(),
    })
}

/// Tags a batch was opened over, in the order given to [`batch_start`].
pub async fn batch_tags(pool: &SqlitePool, batch_id: &str) -> Result<Vec<Tag>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT pool, tag FROM batch_tags
        WHERE batch_id = ?
        ORDER BY position
        "#,
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Tag::from).collect())
}

/// The batch binding of a tag. Tags never used in a batch have none.
pub async fn get_tag_info(pool: &SqlitePool, tag: &Tag) -> Result<TagInfo> {
    let info = sqlx::query_as::<_, TagInfo>(
        "SELECT pool, tag, current_batch FROM current_tags WHERE pool = ? AND tag = ?",
    )
    .bind(&tag.pool)
    .bind(&tag.name)
    .fetch_optional(pool)
    .await?;

    Ok(info.unwrap_or_else(|| TagInfo {
        pool: tag.pool.clone(),
        tag: tag.name.clone(),
        current_batch: None,
    }))
}

fn map_batch_fk(e: sqlx::Error, batch_id: Option<&str>) -> DatabaseError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_foreign_key_violation() {
            return DatabaseError::NotFound {
                entity: "Batch",
                id: batch_id.unwrap_or_default().to_string(),
            };
        }
    }
    DatabaseError::Sqlx(e)
}

/// Store a sent message. Returns `false` if the id was already stored.
pub async fn add_outbound_message(
    pool: &SqlitePool,
    msg: &UserMessage,
    batch_id: Option<&str>,
) -> Result<bool> {
    insert_message(pool, Direction::Outbound, msg, batch_id).await
}

/// Store a received message. Returns `false` if the id was already stored.
///
/// Without an explicit batch the message joins the current batch of the
/// tag in its routing metadata, if there is one.
pub async fn add_inbound_message(
    pool: &SqlitePool,
    msg: &UserMessage,
    batch_id: Option<&str>,
) -> Result<bool> {
    let resolved = match (batch_id, msg.tag()) {
        (Some(batch_id), _) => Some(batch_id.to_string()),
        (None, Some(tag)) => get_tag_info(pool, &tag).await?.current_batch,
        (None, None) => None,
    };
    insert_message(pool, Direction::Inbound, msg, resolved.as_deref()).await
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn table(self) -> &'static str {
        match self {
            Self::Outbound => "outbound_messages",
            Self::Inbound => "inbound_messages",
        }
    }

    fn counter(self) -> &'static str {
        match self {
            Self::Outbound => "outbound_count",
            Self::Inbound => "inbound_count",
        }
    }
}

async fn insert_message(
    pool: &SqlitePool,
    direction: Direction,
    msg: &UserMessage,
    batch_id: Option<&str>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let insert = format!(
        "INSERT INTO {} (message_id, batch_id, msg, created_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(message_id) DO NOTHING",
        direction.table()
    );
    let inserted = sqlx::query(&insert)
        .bind(&msg.message_id)
        .bind(batch_id)
        .bind(Json(msg))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_batch_fk(e, batch_id))?
        .rows_affected()
        == 1;

    if inserted {
        if let Some(batch_id) = batch_id {
            let bump = format!(
                "UPDATE batch_counters SET {0} = {0} + 1 WHERE batch_id = ?",
                direction.counter()
            );
            sqlx::query(&bump).bind(batch_id).execute(&mut *tx).await?;
        }
    } else {
        debug!(message_id = %msg.message_id, table = direction.table(), "Duplicate message ignored");
    }

    tx.commit().await?;
    Ok(inserted)
}

async fn load_message(
    pool: &SqlitePool,
    direction: Direction,
    message_id: &str,
) -> Result<Option<UserMessage>> {
    let query = format!("SELECT msg FROM {} WHERE message_id = ?", direction.table());
    let row: Option<(Json<UserMessage>,)> = sqlx::query_as(&query)
        .bind(message_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(Json(msg),)| msg))
}

/// Load a sent message by id.
pub async fn get_outbound_message(pool: &SqlitePool, message_id: &str) -> Result<Option<UserMessage>> {
    load_message(pool, Direction::Outbound, message_id).await
}

/// Load a received message by id.
pub async fn get_inbound_message(pool: &SqlitePool, message_id: &str) -> Result<Option<UserMessage>> {
    load_message(pool, Direction::Inbound, message_id).await
}

/// Batch a sent message was stored under.
pub async fn outbound_message_batch(pool: &SqlitePool, message_id: &str) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT batch_id FROM outbound_messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(batch_id,)| batch_id))
}

/// Whether an event with this id is already stored.
pub async fn has_event(pool: &SqlitePool, event_id: &str) -> Result<bool> {
    let found: Option<(String,)> = sqlx::query_as("SELECT event_id FROM events WHERE event_id = ?")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}

/// Store a transport event against its outbound message.
///
/// Returns `false` for a duplicate event id. Fails with `NotFound` when the
/// event does not reference a stored outbound message.
pub async fn add_event(pool: &SqlitePool, event: &TransportEvent) -> Result<bool> {
    let message_id = event
        .user_message_id
        .as_deref()
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "OutboundMessage",
            id: String::new(),
        })?;

    let mut tx = pool.begin().await?;

    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT batch_id FROM outbound_messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some((batch_id,)) = row else {
        return Err(DatabaseError::NotFound {
            entity: "OutboundMessage",
            id: message_id.to_string(),
        });
    };

    let inserted = sqlx::query(
        r#"
        INSERT INTO events (event_id, message_id, event_type, delivery_status, event, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(event_id) DO NOTHING
        "#,
    )
    .bind(&event.event_id)
    .bind(message_id)
    .bind(event.event_type.as_str())
    .bind(event.delivery_status.map(|status| status.as_str()))
    .bind(Json(event))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        if let Some(batch_id) = batch_id.as_deref() {
            for column in event_counters(event) {
                let bump = format!(
                    "UPDATE batch_counters SET {0} = {0} + 1 WHERE batch_id = ?",
                    column
                );
                sqlx::query(&bump).bind(batch_id).execute(&mut *tx).await?;
            }
        }
    } else {
        debug!(event_id = %event.event_id, "Duplicate event ignored");
    }

    tx.commit().await?;
    Ok(inserted)
}

fn event_counters(event: &TransportEvent) -> Vec<&'static str> {
    match event.event_type {
        EventType::Ack => vec!["ack"],
        EventType::Nack => vec!["nack"],
        EventType::DeliveryReport => {
            let mut columns = vec!["delivery_report"];
            match event.delivery_status {
                Some(DeliveryStatus::Delivered) => columns.push("delivery_report_delivered"),
                Some(DeliveryStatus::Failed) => columns.push("delivery_report_failed"),
                Some(DeliveryStatus::Pending) => columns.push("delivery_report_pending"),
                None => {}
            }
            columns
        }
    }
}

/// Status counters for a batch. Unknown batches report zeros.
pub async fn batch_status(pool: &SqlitePool, batch_id: &str) -> Result<BatchStatus> {
    let status = sqlx::query_as::<_, BatchStatus>(
        r#"
        SELECT outbound_count AS sent, ack, nack, delivery_report,
               delivery_report_delivered, delivery_report_failed, delivery_report_pending
        FROM batch_counters
        WHERE batch_id = ?
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    Ok(status.unwrap_or_default())
}

/// Cached message counts. Unknown batches report zeros.
pub async fn cached_counts(pool: &SqlitePool, batch_id: &str) -> Result<CachedCounts> {
    let counts = sqlx::query_as::<_, CachedCounts>(
        "SELECT outbound_count, inbound_count FROM batch_counters WHERE batch_id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;
    Ok(counts.unwrap_or_default())
}

async fn count_messages(pool: &SqlitePool, direction: Direction, batch_id: &str) -> Result<i64> {
    let query = format!("SELECT COUNT(*) FROM {} WHERE batch_id = ?", direction.table());
    let (count,): (i64,) = sqlx::query_as(&query).bind(batch_id).fetch_one(pool).await?;
    Ok(count)
}

/// Authoritative number of sent messages in a batch.
pub async fn batch_outbound_count(pool: &SqlitePool, batch_id: &str) -> Result<i64> {
    count_messages(pool, Direction::Outbound, batch_id).await
}

/// Authoritative number of received messages in a batch.
pub async fn batch_inbound_count(pool: &SqlitePool, batch_id: &str) -> Result<i64> {
    count_messages(pool, Direction::Inbound, batch_id).await
}

async fn message_keys(pool: &SqlitePool, direction: Direction, batch_id: &str) -> Result<Vec<String>> {
    let query = format!(
        "SELECT message_id FROM {} WHERE batch_id = ? ORDER BY created_at, message_id",
        direction.table()
    );
    let rows: Vec<(String,)> = sqlx::query_as(&query).bind(batch_id).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Ids of the sent messages in a batch, oldest first.
pub async fn batch_outbound_keys(pool: &SqlitePool, batch_id: &str) -> Result<Vec<String>> {
    message_keys(pool, Direction::Outbound, batch_id).await
}

/// Ids of the received messages in a batch, oldest first.
pub async fn batch_inbound_keys(pool: &SqlitePool, batch_id: &str) -> Result<Vec<String>> {
    message_keys(pool, Direction::Inbound, batch_id).await
}

fn drifted(cached: i64, authoritative: i64, delta: f64) -> bool {
    if authoritative == 0 {
        return cached != 0;
    }
    let drift = (cached - authoritative).abs() as f64 / authoritative as f64;
    drift > delta
}

/// Whether the cached counts differ from the authoritative counts by more
/// than `delta` (relative to the authoritative count).
pub async fn needs_reconciliation(pool: &SqlitePool, batch_id: &str, delta: f64) -> Result<bool> {
    let cached = cached_counts(pool, batch_id).await?;
    let outbound = batch_outbound_count(pool, batch_id).await?;
    let inbound = batch_inbound_count(pool, batch_id).await?;

    let needed = drifted(cached.outbound_count, outbound, delta)
        || drifted(cached.inbound_count, inbound, delta);

    if needed {
        warn!(
            batch_id,
            cached_outbound = cached.outbound_count,
            outbound,
            cached_inbound = cached.inbound_count,
            inbound,
            "Batch counters drifted"
        );
    }
    Ok(needed)
}

/// Rebuild a batch's counters from the message and event tables.
///
/// Runs as one statement so messages stored concurrently are either fully
/// counted or picked up by their own counter bump.
pub async fn reconcile_cache(pool: &SqlitePool, batch_id: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE batch_counters SET
            outbound_count = (SELECT COUNT(*) FROM outbound_messages WHERE batch_id = ?1),
            inbound_count = (SELECT COUNT(*) FROM inbound_messages WHERE batch_id = ?1),
            ack = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'ack'
            ),
            nack = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'nack'
            ),
            delivery_report = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'delivery_report'
            ),
            delivery_report_delivered = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'delivery_report'
                  AND e.delivery_status = 'delivered'
            ),
            delivery_report_failed = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'delivery_report'
                  AND e.delivery_status = 'failed'
            ),
            delivery_report_pending = (
                SELECT COUNT(*) FROM events e JOIN outbound_messages m ON m.message_id = e.message_id
                WHERE m.batch_id = ?1 AND e.event_type = 'delivery_report'
                  AND e.delivery_status = 'pending'
            )
        WHERE batch_id = ?1
        "#,
    )
    .bind(batch_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatabaseError::NotFound {
            entity: "Batch",
            id: batch_id.to_string(),
        });
    }

    info!(batch_id, "Reconciled batch counters");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tagpool, Database};
    use serde_json::json;

    fn account_metadata() -> Map<String, Value> {
        json!({"user_account": "acc-1"}).as_object().cloned().unwrap()
    }

    fn outbound(id: &str) -> UserMessage {
        UserMessage::new("+27831111111", "+27830000000", Some("hi".to_string())).with_message_id(id)
    }

    async fn open_batch(db: &Database) -> (Vec<Tag>, String) {
        let tags = vec![Tag::new("longcode", "1"), Tag::new("longcode", "2")];
        tagpool::declare_tags(db.pool(), &tags).await.unwrap();
        let batch_id = batch_start(db.pool(), &tags, &account_metadata()).await.unwrap();
        (tags, batch_id)
    }

    #[tokio::test]
    async fn test_batch_start_and_done() {
        let db = Database::in_memory().await.unwrap();
        let (tags, batch_id) = open_batch(&db).await;
        assert_eq!(batch_id.len(), 32);
        assert!(batch_id.chars().all(|c| c.is_ascii_hexdigit()));

        let batch = get_batch(db.pool(), &batch_id).await.unwrap();
        assert_eq!(batch.user_account(), Some("acc-1"));
        assert!(!batch.is_closed());
        assert_eq!(batch_tags(db.pool(), &batch_id).await.unwrap(), tags);
        for tag in &tags {
            let info = get_tag_info(db.pool(), tag).await.unwrap();
            assert_eq!(info.current_batch.as_deref(), Some(batch_id.as_str()));
        }

        batch_done(db.pool(), &batch_id).await.unwrap();
        for tag in &tags {
            assert_eq!(get_tag_info(db.pool(), tag).await.unwrap().current_batch, None);
        }
        assert!(get_batch(db.pool(), &batch_id).await.unwrap().is_closed());

        batch_done(db.pool(), &batch_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_start_rejects_bound_tag() {
        let db = Database::in_memory().await.unwrap();
        let (tags, batch_id) = open_batch(&db).await;

        let result = batch_start(db.pool(), &tags[..1], &Map::new()).await;
        assert!(matches!(result, Err(DatabaseError::TagInUse { .. })));

        batch_done(db.pool(), &batch_id).await.unwrap();
        let next = batch_start(db.pool(), &tags[..1], &Map::new()).await.unwrap();
        assert_ne!(next, batch_id);
    }

    #[tokio::test]
    async fn test_batch_done_unknown() {
        let db = Database::in_memory().await.unwrap();
        assert!(matches!(
            batch_done(db.pool(), "missing").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_messages_and_counters() {
        let db = Database::in_memory().await.unwrap();
        let (_, batch_id) = open_batch(&db).await;

        assert!(add_outbound_message(db.pool(), &outbound("m1"), Some(&batch_id)).await.unwrap());
        assert!(add_outbound_message(db.pool(), &outbound("m2"), Some(&batch_id)).await.unwrap());
        assert!(!add_outbound_message(db.pool(), &outbound("m1"), Some(&batch_id)).await.unwrap());

        let counts = cached_counts(db.pool(), &batch_id).await.unwrap();
        assert_eq!(counts.outbound_count, 2);
        assert_eq!(batch_outbound_count(db.pool(), &batch_id).await.unwrap(), 2);
        assert_eq!(batch_outbound_keys(db.pool(), &batch_id).await.unwrap().len(), 2);

        let stored = get_outbound_message(db.pool(), "m1").await.unwrap().unwrap();
        assert_eq!(stored.content.as_deref(), Some("hi"));
        assert_eq!(
            outbound_message_batch(db.pool(), "m1").await.unwrap().as_deref(),
            Some(batch_id.as_str())
        );
        assert!(get_outbound_message(db.pool(), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inbound_follows_tag_batch() {
        let db = Database::in_memory().await.unwrap();
        let (tags, batch_id) = open_batch(&db).await;

        let mut reply = UserMessage::new("1", "+27831111111", Some("yes".to_string()));
        reply.set_tag(&tags[0]);
        add_inbound_message(db.pool(), &reply, None).await.unwrap();

        assert_eq!(batch_inbound_count(db.pool(), &batch_id).await.unwrap(), 1);
        assert_eq!(
            batch_inbound_keys(db.pool(), &batch_id).await.unwrap(),
            vec![reply.message_id.clone()]
        );
        assert!(get_inbound_message(db.pool(), &reply.message_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        let result = add_outbound_message(db.pool(), &outbound("m1"), Some("ghost")).await;
        assert!(matches!(result, Err(DatabaseError::NotFound { entity: "Batch", .. })));
    }

    #[tokio::test]
    async fn test_events_update_status() {
        let db = Database::in_memory().await.unwrap();
        let (_, batch_id) = open_batch(&db).await;
        add_outbound_message(db.pool(), &outbound("m1"), Some(&batch_id)).await.unwrap();

        let ack = TransportEvent::ack("m1", "remote-1");
        assert!(add_event(db.pool(), &ack).await.unwrap());
        assert!(!add_event(db.pool(), &ack).await.unwrap());
        add_event(db.pool(), &TransportEvent::delivery_report("m1", DeliveryStatus::Delivered))
            .await
            .unwrap();

        let status = batch_status(db.pool(), &batch_id).await.unwrap();
        assert_eq!(status.sent, 1);
        assert_eq!(status.ack, 1);
        assert_eq!(status.delivery_report, 1);
        assert_eq!(status.delivery_report_delivered, 1);
        assert_eq!(status.nack, 0);

        let orphan = TransportEvent::ack("missing", "remote-2");
        assert!(matches!(
            add_event(db.pool(), &orphan).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconcile_after_drift() {
        let db = Database::in_memory().await.unwrap();
        let (_, batch_id) = open_batch(&db).await;
        for i in 0..10 {
            add_outbound_message(db.pool(), &outbound(&format!("m{}", i)), Some(&batch_id))
                .await
                .unwrap();
        }
        add_event(db.pool(), &TransportEvent::nack("m0", "no route")).await.unwrap();
        assert!(!needs_reconciliation(db.pool(), &batch_id, DEFAULT_RECONCILIATION_DELTA)
            .await
            .unwrap());

        sqlx::query("UPDATE batch_counters SET outbound_count = 3, nack = 0 WHERE batch_id = ?")
            .bind(&batch_id)
            .execute(db.pool())
            .await
            .unwrap();
        assert!(needs_reconciliation(db.pool(), &batch_id, DEFAULT_RECONCILIATION_DELTA)
            .await
            .unwrap());

        reconcile_cache(db.pool(), &batch_id).await.unwrap();
        assert_eq!(cached_counts(db.pool(), &batch_id).await.unwrap().outbound_count, 10);
        assert_eq!(batch_status(db.pool(), &batch_id).await.unwrap().nack, 1);
        assert!(!needs_reconciliation(db.pool(), &batch_id, DEFAULT_RECONCILIATION_DELTA)
            .await
            .unwrap());
    }

    #[test]
    fn test_drift_rule() {
        assert!(!drifted(0, 0, 0.01));
        assert!(drifted(1, 0, 0.01));
        assert!(!drifted(100, 101, 0.01));
        assert!(drifted(97, 100, 0.01));
        assert!(drifted(3, 2, 0.3));
    }
}
