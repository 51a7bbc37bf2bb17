//! Recovery branches: fresh conversations seeded from the last valid history.

use std::fmt;
use std::sync::Arc;

use completion_provider::Turn;
use conversation_store::{
    Conversation, ConversationStore, LifecycleState, NewTurn, StoreError, StoredTurn,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::locks::ConversationGuard;
use crate::validator::{IntegrityValidator, IntegrityViolation};

pub const BRANCH_OF_PREFIX: &str = "branch_of:";
pub const MERGED_FROM_PREFIX: &str = "merged_from:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Copy the turns authored in the branch onto the primary.
    Append,
    /// Discard the primary's turns and adopt the branch's.
    Replace,
    /// Reserved.
    Interleave,
}

impl MergeStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Replace => "replace",
            Self::Interleave => "interleave",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("conversation {conversation_id} is archived and cannot be branched again")]
    AlreadyArchived { conversation_id: String },
    #[error("merge strategy '{0}' is not supported")]
    UnsupportedStrategy(MergeStrategy),
    #[error("conversation {branch_id} is not a branch of {primary_id}")]
    NotABranch {
        branch_id: String,
        primary_id: String,
    },
    #[error("merging {branch_id} would leave {primary_id} invalid: {violation}")]
    InvalidMerge {
        primary_id: String,
        branch_id: String,
        #[source]
        violation: IntegrityViolation,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub strategy: MergeStrategy,
    pub primary: Conversation,
    pub turns_copied: usize,
}

pub struct BranchManager {
    store: Arc<dyn ConversationStore>,
    validator: Arc<IntegrityValidator>,
}

impl BranchManager {
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, validator: Arc<IntegrityValidator>) -> Self {
        Self { store, validator }
    }

    /// Copies the longest valid prefix into a new stable conversation and
    /// archives the original in the `error` state.
    pub fn create_recovery_branch(
        &self,
        guard: &ConversationGuard,
    ) -> Result<Conversation, BranchError> {
        let origin_id = guard.conversation_id();
        let mut origin = self.store.conversation(origin_id)?;
        if origin.archived {
            return Err(BranchError::AlreadyArchived {
                conversation_id: origin_id.to_string(),
            });
        }
        let turns = self.store.turns(origin_id)?;
        let keep = self.validator.longest_valid_prefix(&turns);

        let branch = self
            .store
            .create_conversation(&origin.owner, Some(origin_id))?;
        let provenance = format!("{BRANCH_OF_PREFIX}{origin_id}");
        let seeded: Vec<NewTurn> = turns[..keep]
            .iter()
            .map(|turn| NewTurn::with_provenance(turn.turn.clone(), provenance.clone()))
            .collect();
        if !seeded.is_empty() {
            self.store.append_turns(&branch.id, seeded)?;
        }

        origin.archived = true;
        origin.lifecycle = LifecycleState::Error;
        self.store.save_conversation(&origin)?;

        tracing::warn!(
            origin_id,
            branch_id = %branch.id,
            kept = keep,
            dropped = turns.len() - keep,
            "created recovery branch"
        );
        Ok(self.store.conversation(&branch.id)?)
    }

    pub fn merge(
        &self,
        primary: &ConversationGuard,
        branch: &ConversationGuard,
        strategy: MergeStrategy,
    ) -> Result<MergeReport, BranchError> {
        if strategy == MergeStrategy::Interleave {
            return Err(BranchError::UnsupportedStrategy(strategy));
        }

        let primary_id = primary.conversation_id();
        let branch_id = branch.conversation_id();
        let mut branch_conversation = self.store.conversation(branch_id)?;
        if branch_conversation.parent_id.as_deref() != Some(primary_id) {
            return Err(BranchError::NotABranch {
                branch_id: branch_id.to_string(),
                primary_id: primary_id.to_string(),
            });
        }

        let primary_turns = self.store.turns(primary_id)?;
        let branch_turns = self.store.turns(branch_id)?;
        let provenance = format!("{MERGED_FROM_PREFIX}{branch_id}");
        let copied: Vec<&StoredTurn> = match strategy {
            MergeStrategy::Append => branch_turns
                .iter()
                .filter(|turn| !is_seeded_from(turn, primary_id))
                .collect(),
            _ => branch_turns.iter().collect(),
        };

        let candidate: Vec<Turn> = match strategy {
            MergeStrategy::Append => primary_turns
                .iter()
                .map(|turn| turn.turn.clone())
                .chain(copied.iter().map(|turn| turn.turn.clone()))
                .collect(),
            _ => copied.iter().map(|turn| turn.turn.clone()).collect(),
        };
        self.validator
            .check(&candidate)
            .map_err(|violation| BranchError::InvalidMerge {
                primary_id: primary_id.to_string(),
                branch_id: branch_id.to_string(),
                violation,
            })?;

        let new_turns: Vec<NewTurn> = copied
            .iter()
            .map(|turn| NewTurn::with_provenance(turn.turn.clone(), provenance.clone()))
            .collect();
        let turns_copied = new_turns.len();
        match strategy {
            MergeStrategy::Append if new_turns.is_empty() => {}
            MergeStrategy::Append => {
                self.store.append_turns(primary_id, new_turns)?;
            }
            _ => {
                self.store.replace_turns(primary_id, new_turns)?;
            }
        }

        branch_conversation.archived = true;
        self.store.save_conversation(&branch_conversation)?;

        let mut primary_conversation = self.store.conversation(primary_id)?;
        primary_conversation.archived = false;
        primary_conversation.mark_stable(OffsetDateTime::now_utc());
        let primary_conversation = self.store.save_conversation(&primary_conversation)?;

        tracing::info!(
            primary_id,
            branch_id,
            strategy = strategy.as_str(),
            turns_copied,
            "merged branch"
        );
        Ok(MergeReport {
            strategy,
            primary: primary_conversation,
            turns_copied,
        })
    }
}

fn is_seeded_from(turn: &StoredTurn, origin_id: &str) -> bool {
    turn.provenance
        .as_deref()
        .and_then(|provenance| provenance.strip_prefix(BRANCH_OF_PREFIX))
        .is_some_and(|origin| origin == origin_id)
}
