//! The durable queue store and its claim protocol.
//!
//! `QueueStore` is the only thing workers share. Every operation that
//! touches ownership or stage is a single atomic conditional update, so
//! workers in different processes coordinate through the store alone.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{ClaimPolicy, Message, MessageId, Stage, WorkerId};

/// Validate a stage transition, returning an error if disallowed.
pub(crate) fn validate_transition(from: Stage, to: Stage) -> Result<()> {
    if from.can_advance_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Persist a new message at `Uploaded`, unowned.
    async fn insert(&self, payload: &[u8]) -> Result<MessageId>;

    /// Atomically take ownership of every claimable message (subject to
    /// `policy`). Returns how many rows were claimed.
    async fn claim_batch(&self, worker: &WorkerId, policy: ClaimPolicy) -> Result<u64>;

    /// Lowest non-terminal message id owned by `worker`.
    async fn next_owned(&self, worker: &WorkerId) -> Result<Option<MessageId>>;

    /// Every non-terminal message id owned by `worker`, ascending.
    async fn owned_ids(&self, worker: &WorkerId) -> Result<Vec<MessageId>>;

    async fn get_stage(&self, id: MessageId) -> Result<Stage>;

    async fn get_message(&self, id: MessageId) -> Result<Message>;

    /// Move `id` from `from` to `to` and clear ownership, only if it is at
    /// `from` and owned by `worker`. Otherwise nothing changes and
    /// `Error::StaleTransition` is returned.
    async fn advance(&self, id: MessageId, worker: &WorkerId, from: Stage, to: Stage)
    -> Result<()>;

    /// Give up ownership without advancing. `StaleTransition` if `worker`
    /// does not own `id`.
    async fn release(&self, id: MessageId, worker: &WorkerId) -> Result<()>;

    /// `Done` messages with id greater than `after`, ascending.
    async fn done_after(&self, after: MessageId, limit: i64) -> Result<Vec<Message>>;

    /// Number of messages per stage, in stage order. Stages with no
    /// messages are reported as zero.
    async fn stage_counts(&self) -> Result<Vec<(Stage, i64)>>;
}
