//! In-process queue store.
//!
//! Same contract as the Postgres store, with one mutex standing in for
//! row-level locking: every operation runs entirely under the lock, so each
//! one is a single atomic step. Not durable. Used for tests and for
//! embedding the queue where a database is not available.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{QueueStore, validate_transition};
use crate::error::{Error, Result};
use crate::model::{ClaimPolicy, Message, MessageId, Stage, WorkerId};

struct Inner {
    /// Keyed by id, so iteration is in id order.
    messages: BTreeMap<MessageId, Message>,
    next_id: i64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store lock poisoned".to_string()))
    }

    /// Snapshot of a message, for assertions.
    pub fn snapshot(&self, id: MessageId) -> Option<Message> {
        self.inner.lock().ok()?.messages.get(&id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn insert(&self, payload: &[u8]) -> Result<MessageId> {
        let mut inner = self.lock()?;
        let id = MessageId(inner.next_id);
        inner.next_id += 1;
        inner.messages.insert(
            id,
            Message {
                id,
                stage: Stage::Uploaded,
                owner: None,
                claimed_at: None,
                payload: payload.to_vec(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn claim_batch(&self, worker: &WorkerId, policy: ClaimPolicy) -> Result<u64> {
        let now = Utc::now();
        // A lease too long to subtract from now never expires.
        let expired_before = policy
            .lease
            .and_then(|lease| chrono::Duration::from_std(lease).ok())
            .and_then(|lease| now.checked_sub_signed(lease));
        let limit = policy.limit.map(|n| n.max(0) as usize).unwrap_or(usize::MAX);

        let mut inner = self.lock()?;
        let mut claimed = 0u64;
        for msg in inner.messages.values_mut() {
            if claimed as usize >= limit {
                break;
            }
            let orphaned = !msg.stage.is_terminal()
                && match (&msg.owner, msg.claimed_at, expired_before) {
                    (Some(_), Some(at), Some(cutoff)) => at < cutoff,
                    _ => false,
                };
            if msg.is_claimable() || orphaned {
                msg.owner = Some(worker.clone());
                msg.claimed_at = Some(now);
                claimed += 1;
            }
        }
        Ok(claimed)
    }

    async fn next_owned(&self, worker: &WorkerId) -> Result<Option<MessageId>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .values()
            .find(|m| m.owner.as_ref() == Some(worker) && !m.stage.is_terminal())
            .map(|m| m.id))
    }

    async fn owned_ids(&self, worker: &WorkerId) -> Result<Vec<MessageId>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.owner.as_ref() == Some(worker) && !m.stage.is_terminal())
            .map(|m| m.id)
            .collect())
    }

    async fn get_stage(&self, id: MessageId) -> Result<Stage> {
        let inner = self.lock()?;
        inner
            .messages
            .get(&id)
            .map(|m| m.stage)
            .ok_or(Error::NotFound(id))
    }

    async fn get_message(&self, id: MessageId) -> Result<Message> {
        let inner = self.lock()?;
        inner.messages.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn advance(
        &self,
        id: MessageId,
        worker: &WorkerId,
        from: Stage,
        to: Stage,
    ) -> Result<()> {
        validate_transition(from, to)?;

        let mut inner = self.lock()?;
        match inner.messages.get_mut(&id) {
            Some(msg) if msg.stage == from && msg.owner.as_ref() == Some(worker) => {
                msg.stage = to;
                msg.owner = None;
                msg.claimed_at = None;
                Ok(())
            }
            Some(_) => Err(Error::StaleTransition { id, from, to }),
            None => Err(Error::NotFound(id)),
        }
    }

    async fn release(&self, id: MessageId, worker: &WorkerId) -> Result<()> {
        let mut inner = self.lock()?;
        match inner.messages.get_mut(&id) {
            Some(msg) if msg.owner.as_ref() == Some(worker) => {
                msg.owner = None;
                msg.claimed_at = None;
                Ok(())
            }
            Some(msg) => Err(Error::StaleTransition {
                id,
                from: msg.stage,
                to: msg.stage,
            }),
            None => Err(Error::NotFound(id)),
        }
    }

    async fn done_after(&self, after: MessageId, limit: i64) -> Result<Vec<Message>> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, m)| m)
            .filter(|m| m.stage == Stage::Done)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn stage_counts(&self) -> Result<Vec<(Stage, i64)>> {
        let inner = self.lock()?;
        Ok(Stage::ALL
            .iter()
            .map(|&stage| {
                let n = inner.messages.values().filter(|m| m.stage == stage).count();
                (stage, n as i64)
            })
            .collect())
    }
}
