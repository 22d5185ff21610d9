//! Message queue operations via direct SQLx.
//!
//! Every statement is parameterized. Ownership changes are single
//! conditional UPDATEs; claims lock candidate rows with
//! `FOR UPDATE SKIP LOCKED` so concurrent claimers never pick the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ClaimPolicy, Message, MessageId, Stage, WorkerId};
use crate::store::{QueueStore, validate_transition};

impl super::Db {
    async fn exists(&self, id: MessageId) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM messages WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl QueueStore for super::Db {
    async fn insert(&self, payload: &[u8]) -> Result<MessageId> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO messages (stage, owner, claimed_at, payload)
             VALUES ($1, NULL, NULL, $2)
             RETURNING id",
        )
        .bind(Stage::Uploaded.as_i32())
        .bind(payload)
        .fetch_one(self.pool())
        .await?;
        Ok(MessageId(row.0))
    }

    async fn claim_batch(&self, worker: &WorkerId, policy: ClaimPolicy) -> Result<u64> {
        let lease_secs = policy.lease.map(|d| d.as_secs_f64());

        let rows_affected = sqlx::query(
            "WITH claimable AS (
                 SELECT id FROM messages
                 WHERE stage <> $2
                   AND (owner IS NULL
                        OR ($3::double precision IS NOT NULL
                            AND claimed_at < now() - make_interval(secs => $3::double precision)))
                 ORDER BY id
                 LIMIT $4
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE messages SET owner = $1, claimed_at = now()
             FROM claimable
             WHERE messages.id = claimable.id",
        )
        .bind(worker.as_str())
        .bind(Stage::Done.as_i32())
        .bind(lease_secs)
        .bind(policy.limit)
        .execute(self.pool())
        .await?
        .rows_affected();

        debug!(worker = %worker, claimed = rows_affected, "claim_batch");
        Ok(rows_affected)
    }

    async fn next_owned(&self, worker: &WorkerId) -> Result<Option<MessageId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM messages
             WHERE owner = $1 AND stage <> $2
             ORDER BY id
             LIMIT 1",
        )
        .bind(worker.as_str())
        .bind(Stage::Done.as_i32())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id,)| MessageId(id)))
    }

    async fn owned_ids(&self, worker: &WorkerId) -> Result<Vec<MessageId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM messages
             WHERE owner = $1 AND stage <> $2
             ORDER BY id",
        )
        .bind(worker.as_str())
        .bind(Stage::Done.as_i32())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| MessageId(id)).collect())
    }

    async fn get_stage(&self, id: MessageId) -> Result<Stage> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT stage FROM messages WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        let (stage,) = row.ok_or(Error::NotFound(id))?;
        Stage::try_from(stage)
    }

    async fn get_message(&self, id: MessageId) -> Result<Message> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, stage, owner, claimed_at, payload, created_at
             FROM messages WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or(Error::NotFound(id))?.try_into_message()
    }

    async fn advance(
        &self,
        id: MessageId,
        worker: &WorkerId,
        from: Stage,
        to: Stage,
    ) -> Result<()> {
        validate_transition(from, to)?;

        let rows_affected = sqlx::query(
            "UPDATE messages SET stage = $1, owner = NULL, claimed_at = NULL
             WHERE id = $2 AND stage = $3 AND owner = $4",
        )
        .bind(to.as_i32())
        .bind(id.0)
        .bind(from.as_i32())
        .bind(worker.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            if !self.exists(id).await? {
                return Err(Error::NotFound(id));
            }
            return Err(Error::StaleTransition { id, from, to });
        }
        Ok(())
    }

    async fn release(&self, id: MessageId, worker: &WorkerId) -> Result<()> {
        let row: Option<(i32,)> = sqlx::query_as(
            "UPDATE messages SET owner = NULL, claimed_at = NULL
             WHERE id = $1 AND owner = $2
             RETURNING stage",
        )
        .bind(id.0)
        .bind(worker.as_str())
        .fetch_optional(self.pool())
        .await?;

        if row.is_some() {
            return Ok(());
        }
        let stage = self.get_stage(id).await?;
        Err(Error::StaleTransition {
            id,
            from: stage,
            to: stage,
        })
    }

    async fn done_after(&self, after: MessageId, limit: i64) -> Result<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, stage, owner, claimed_at, payload, created_at
             FROM messages
             WHERE stage = $1 AND id > $2
             ORDER BY id
             LIMIT $3",
        )
        .bind(Stage::Done.as_i32())
        .bind(after.0)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(MessageRow::try_into_message).collect()
    }

    async fn stage_counts(&self) -> Result<Vec<(Stage, i64)>> {
        let rows: Vec<(i32, i64)> =
            sqlx::query_as("SELECT stage, count(*) FROM messages GROUP BY stage")
                .fetch_all(self.pool())
                .await?;

        let mut counts: Vec<(Stage, i64)> = Stage::ALL.iter().map(|&s| (s, 0)).collect();
        for (stage, n) in rows {
            let stage = Stage::try_from(stage)?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == stage) {
                entry.1 = n;
            }
        }
        Ok(counts)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    stage: i32,
    owner: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn try_into_message(self) -> Result<Message> {
        Ok(Message {
            id: MessageId(self.id),
            stage: Stage::try_from(self.stage)?,
            owner: self.owner.map(WorkerId),
            claimed_at: self.claimed_at,
            payload: self.payload,
            created_at: self.created_at,
        })
    }
}
