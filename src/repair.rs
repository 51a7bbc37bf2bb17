//! Best-effort cleanup that restores a valid turn sequence.

use std::collections::HashSet;
use std::sync::Arc;

use completion_provider::Role;
use conversation_store::{ConversationStore, LifecycleState, StoreError, StoredTurn};
use thiserror::Error;
use time::OffsetDateTime;

use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::locks::ConversationGuard;
use crate::validator::{IntegrityValidator, IntegrityViolation};

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("repair left conversation {conversation_id} invalid: {violation}")]
    Unrepairable {
        conversation_id: String,
        #[source]
        violation: IntegrityViolation,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Tool turns without a well-formed reference.
    pub removed_malformed: usize,
    /// Tool turns referencing no earlier invocation.
    pub removed_orphaned: usize,
    /// Second answers to an already answered invocation.
    pub removed_duplicates: usize,
    /// Assistant turns whose invocations were never fully answered.
    pub incomplete_exchanges: usize,
    /// Turns dropped by truncating to the last valid prefix.
    pub truncated: usize,
    /// Snapshot taken before anything was deleted.
    pub safety_checkpoint: Option<String>,
}

impl RepairReport {
    #[must_use]
    pub fn removed_total(&self) -> usize {
        self.removed_malformed + self.removed_orphaned + self.removed_duplicates + self.truncated
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.removed_total() == 0 && self.incomplete_exchanges == 0
    }
}

/// Sequence numbers to delete, and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairPlan {
    pub malformed: Vec<u64>,
    pub orphaned: Vec<u64>,
    pub duplicates: Vec<u64>,
    pub incomplete_exchanges: usize,
    pub truncated: Vec<u64>,
}

impl RepairPlan {
    #[must_use]
    pub fn deletions(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .malformed
            .iter()
            .chain(&self.orphaned)
            .chain(&self.duplicates)
            .chain(&self.truncated)
            .copied()
            .collect();
        seqs.sort_unstable();
        seqs
    }

    fn report(&self, safety_checkpoint: Option<String>) -> RepairReport {
        RepairReport {
            removed_malformed: self.malformed.len(),
            removed_orphaned: self.orphaned.len(),
            removed_duplicates: self.duplicates.len(),
            incomplete_exchanges: self.incomplete_exchanges,
            truncated: self.truncated.len(),
            safety_checkpoint,
        }
    }
}

pub struct SequenceRepairer {
    store: Arc<dyn ConversationStore>,
    validator: Arc<IntegrityValidator>,
    checkpoints: Arc<CheckpointManager>,
}

impl SequenceRepairer {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        validator: Arc<IntegrityValidator>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            store,
            validator,
            checkpoints,
        }
    }

    /// Computes deletions without touching the store. Empty for valid input.
    pub fn plan(&self, turns: &[StoredTurn]) -> RepairPlan {
        let mut plan = RepairPlan::default();
        // Only invocations emitted before a tool turn can be answered by it.
        let mut emitted: HashSet<&str> = HashSet::new();
        let mut answered: HashSet<&str> = HashSet::new();
        let mut kept: Vec<&StoredTurn> = Vec::with_capacity(turns.len());
        for turn in turns {
            if turn.role() != Role::Tool {
                if turn.role() == Role::Assistant {
                    emitted.extend(turn.turn.tool_calls.iter().map(|call| call.id.as_str()));
                }
                kept.push(turn);
                continue;
            }
            let reference = turn.turn.tool_call_id.as_deref();
            match reference {
                Some(id) if self.validator.is_well_formed_reference(reference) => {
                    if !emitted.contains(id) {
                        plan.orphaned.push(turn.seq);
                    } else if !answered.insert(id) {
                        plan.duplicates.push(turn.seq);
                    } else {
                        kept.push(turn);
                    }
                }
                _ => plan.malformed.push(turn.seq),
            }
        }

        let remaining: Vec<StoredTurn> = kept.into_iter().cloned().collect();
        let violations = self.validator.violations(&remaining);
        plan.incomplete_exchanges = violations
            .iter()
            .filter(|violation| matches!(violation, IntegrityViolation::IncompleteToolExchange { .. }))
            .count();

        if !violations.is_empty() {
            let keep = self.validator.longest_valid_prefix(&remaining);
            plan.truncated = remaining[keep..].iter().map(|turn| turn.seq).collect();
        }

        plan
    }

    /// Applies [`Self::plan`] and marks the conversation stable. Idempotent.
    pub fn repair(&self, guard: &ConversationGuard) -> Result<RepairReport, RepairError> {
        let conversation_id = guard.conversation_id();
        let turns = self.store.turns(conversation_id)?;
        let plan = self.plan(&turns);
        let deletions = plan.deletions();

        let mut safety_checkpoint = None;
        if !deletions.is_empty() {
            let checkpoint = self.checkpoints.create_pre_repair(guard, &turns)?;
            safety_checkpoint = Some(checkpoint.name);
            self.store.delete_turns(conversation_id, &deletions)?;
        }

        let repaired = self.store.turns(conversation_id)?;
        if let Err(violation) = self.validator.check(&repaired) {
            tracing::error!(conversation_id, %violation, "repair could not produce a valid prefix");
            return Err(RepairError::Unrepairable {
                conversation_id: conversation_id.to_string(),
                violation,
            });
        }

        let mut conversation = self.store.conversation(conversation_id)?;
        if !deletions.is_empty() || conversation.lifecycle != LifecycleState::Stable {
            conversation.mark_stable(OffsetDateTime::now_utc());
            self.store.save_conversation(&conversation)?;
        }

        let report = plan.report(safety_checkpoint);
        if report.is_clean() {
            tracing::debug!(conversation_id, "repair found nothing to do");
        } else {
            tracing::info!(
                conversation_id,
                malformed = report.removed_malformed,
                orphaned = report.removed_orphaned,
                duplicates = report.removed_duplicates,
                incomplete = report.incomplete_exchanges,
                truncated = report.truncated,
                "repaired conversation"
            );
        }
        Ok(report)
    }
}
