use completion_provider::{Role, Turn};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Log format version written into every conversation header.
pub const LOG_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stable,
    NeedsCleanup,
    Error,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::NeedsCleanup => "needs_cleanup",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub lifecycle: LifecycleState,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Bumped by every successful `save_conversation`; used for compare-and-swap.
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_known_good_at: Option<OffsetDateTime>,
}

impl Conversation {
    #[must_use]
    pub fn new(id: impl Into<String>, owner: impl Into<String>, parent_id: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            owner: owner.into(),
            lifecycle: LifecycleState::Stable,
            archived: false,
            parent_id,
            version: 0,
            created_at: now,
            last_known_good_at: Some(now),
        }
    }

    /// Marks the conversation healthy as of `now`.
    pub fn mark_stable(&mut self, now: OffsetDateTime) {
        self.lifecycle = LifecycleState::Stable;
        self.last_known_good_at = Some(now);
    }
}

/// A turn as persisted: the wire turn plus ordering and provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTurn {
    /// Per-conversation, strictly increasing, never reused.
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    #[serde(flatten)]
    pub turn: Turn,
}

impl StoredTurn {
    #[must_use]
    pub fn role(&self) -> Role {
        self.turn.role
    }
}

impl AsRef<Turn> for StoredTurn {
    fn as_ref(&self) -> &Turn {
        &self.turn
    }
}

/// A turn waiting to be appended; the store assigns `seq` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTurn {
    pub turn: Turn,
    pub provenance: Option<String>,
}

impl NewTurn {
    #[must_use]
    pub fn with_provenance(turn: Turn, provenance: impl Into<String>) -> Self {
        Self {
            turn,
            provenance: Some(provenance.into()),
        }
    }
}

impl From<Turn> for NewTurn {
    fn from(turn: Turn) -> Self {
        Self {
            turn,
            provenance: None,
        }
    }
}

/// Named, read-only snapshot of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Highest turn sequence covered by the snapshot.
    pub last_seq: u64,
    pub turn_count: usize,
    pub tool_call_count: usize,
    pub lifecycle_state: LifecycleState,
    pub turns_snapshot: Vec<StoredTurn>,
    pub context_summary: String,
}

impl Checkpoint {
    #[must_use]
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            name: self.name.clone(),
            created_at: self.created_at,
            turn_count: self.turn_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub turn_count: usize,
}

/// One line of a conversation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRecord {
    Header {
        format_version: u32,
        conversation: Conversation,
    },
    State {
        conversation: Conversation,
    },
    Turn {
        turn: StoredTurn,
    },
    Delete {
        seqs: Vec<u64>,
    },
    Checkpoint {
        checkpoint: Checkpoint,
    },
    CheckpointRemoved {
        name: String,
    },
}
