//! Core data model.
//!
//! A message is an opaque payload moving through a closed, ordered set of
//! stages. Ownership (`owner` + `claimed_at`) says which worker is driving it
//! right now.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A message as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Assigned by the store on insert. Monotonic, immutable.
    pub id: MessageId,

    /// Current processing stage. Only ever moves forward.
    pub stage: Stage,

    /// Worker currently holding the message, if any.
    pub owner: Option<WorkerId>,

    /// When the current owner claimed it. Cleared together with `owner`.
    pub claimed_at: Option<DateTime<Utc>>,

    /// Producer-supplied bytes. The queue never interprets them.
    pub payload: Vec<u8>,

    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Claimable iff unowned and not terminal.
    pub fn is_claimable(&self) -> bool {
        self.owner.is_none() && !self.stage.is_terminal()
    }

    /// The payload as standard base64, for text outputs that must keep
    /// arbitrary bytes intact.
    pub fn payload_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.payload)
    }
}

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a worker, written into `owner` on claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Processing stage of a message. The derive order is the stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Persisted from the intake buffer, not yet unpacked.
    Uploaded,
    /// Unpacked and waiting for delivery.
    Ready,
    /// Delivered. Terminal.
    Done,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Uploaded, Stage::Ready, Stage::Done];

    /// The stage immediately after this one, or `None` for `Done`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Uploaded => Some(Stage::Ready),
            Stage::Ready => Some(Stage::Done),
            Stage::Done => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Done
    }

    /// Can a handler move a message from self to `to`?
    pub fn can_advance_to(self, to: Stage) -> bool {
        self.next() == Some(to)
    }

    /// Integer stored in the `stage` column.
    pub fn as_i32(self) -> i32 {
        match self {
            Stage::Uploaded => 0,
            Stage::Ready => 1,
            Stage::Done => 2,
        }
    }
}

impl TryFrom<i32> for Stage {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Stage::Uploaded),
            1 => Ok(Stage::Ready),
            2 => Ok(Stage::Done),
            other => Err(Error::Other(format!("unknown stage value: {other}"))),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Uploaded => "uploaded",
            Stage::Ready => "ready",
            Stage::Done => "done",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(Stage::Uploaded),
            "ready" => Ok(Stage::Ready),
            "done" => Ok(Stage::Done),
            other => Err(Error::Other(format!("unknown stage: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Claim policy
// ---------------------------------------------------------------------------

/// Knobs for `claim_batch`. The default claims every claimable message and
/// never reclaims, which is the plain ownership protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClaimPolicy {
    /// Upper bound on rows claimed in one call (lowest ids first).
    pub limit: Option<i64>,
    /// Claims older than this are considered orphaned and may be taken over.
    pub lease: Option<std::time::Duration>,
}

impl ClaimPolicy {
    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn lease(mut self, lease: std::time::Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}
