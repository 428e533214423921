//! Durable queues in the shared store.
//!
//! Worker processes exchange commands, transport messages and events
//! through `bus_queue`. A consumer claims the oldest claimable row of a
//! queue under a lease, hands the payload on, then acks it. A row whose
//! lease runs out before the ack is claimed again, so delivery is at least
//! once.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::Result;

/// A claimed queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: i64,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    /// Claims so far, this one included.
    pub attempts: i64,
}

type QueuedRow = (i64, String, String, Json<Value>, i64);

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Append a payload to a queue. Returns the row id.
pub async fn enqueue(
    pool: &SqlitePool,
    exchange: &str,
    routing_key: &str,
    payload: &Value,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO bus_queue (exchange, routing_key, payload, enqueued_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(exchange)
    .bind(routing_key)
    .bind(Json(payload))
    .bind(Utc::now())
    .execute(pool)
    .await?
    .last_insert_rowid();

    debug!(exchange, routing_key, id, "Enqueued message");
    Ok(id)
}

/// Claim the oldest claimable row of a queue for `lease`.
///
/// One statement picks and marks the row, so two consumers never hold the
/// same row at once.
pub async fn claim(
    pool: &SqlitePool,
    exchange: &str,
    routing_key: &str,
    consumer: &str,
    lease: Duration,
) -> Result<Option<QueuedMessage>> {
    let now = now_millis();
    let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

    let row: Option<QueuedRow> = sqlx::query_as(
        r#"
        UPDATE bus_queue
        SET claimed_by = ?, lease_expires_at = ?, attempts = attempts + 1
        WHERE id = (
            SELECT id FROM bus_queue
            WHERE exchange = ? AND routing_key = ?
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
            ORDER BY id
            LIMIT 1
        )
        RETURNING id, exchange, routing_key, payload, attempts
        "#,
    )
    .bind(consumer)
    .bind(now.saturating_add(lease_ms))
    .bind(exchange)
    .bind(routing_key)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    let Some((id, exchange, routing_key, Json(payload), attempts)) = row else {
        return Ok(None);
    };
    if attempts > 1 {
        warn!(id, routing_key = %routing_key, attempts, "Redelivering message after lapsed lease");
    }
    Ok(Some(QueuedMessage {
        id,
        exchange,
        routing_key,
        payload,
        attempts,
    }))
}

/// Remove a claimed row. Returns `false` if it was already gone.
pub async fn ack(pool: &SqlitePool, id: i64) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM bus_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted == 1)
}

/// Drop the claim on a row so it can be claimed again straight away.
pub async fn release(pool: &SqlitePool, id: i64) -> Result<bool> {
    let released = sqlx::query(
        "UPDATE bus_queue SET claimed_by = NULL, lease_expires_at = NULL WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(released == 1)
}

/// Rows on a queue, claimed or not.
pub async fn depth(pool: &SqlitePool, exchange: &str, routing_key: &str) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM bus_queue WHERE exchange = ? AND routing_key = ?")
            .bind(exchange)
            .bind(routing_key)
            .fetch_one(pool)
            .await?;
    Ok(count)
}
