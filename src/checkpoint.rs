//! Named snapshots of a conversation and point-in-time restore.

use std::sync::Arc;

use completion_provider::Role;
use conversation_store::{
    Checkpoint, CheckpointSummary, ConversationStore, LifecycleState, NewTurn, StoreError,
    StoredTurn,
};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::locks::ConversationGuard;
use crate::validator::{IntegrityValidator, IntegrityViolation};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{name}' not found for conversation {conversation_id}")]
    NotFound {
        conversation_id: String,
        name: String,
    },
    #[error("checkpoint '{name}' already exists for conversation {conversation_id}")]
    DuplicateName {
        conversation_id: String,
        name: String,
    },
    #[error("conversation {conversation_id} cannot be checkpointed: {violation}")]
    InvalidConversation {
        conversation_id: String,
        #[source]
        violation: IntegrityViolation,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CheckpointManager {
    store: Arc<dyn ConversationStore>,
    validator: Arc<IntegrityValidator>,
    history_limit: usize,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        validator: Arc<IntegrityValidator>,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            validator,
            history_limit: history_limit.max(1),
        }
    }

    /// Snapshots the conversation. It must pass full validation.
    pub fn create(
        &self,
        guard: &ConversationGuard,
        name: Option<&str>,
    ) -> Result<Checkpoint, CheckpointError> {
        let conversation_id = guard.conversation_id();
        let turns = self.store.turns(conversation_id)?;
        self.validator
            .check(&turns)
            .map_err(|violation| CheckpointError::InvalidConversation {
                conversation_id: conversation_id.to_string(),
                violation,
            })?;

        let lifecycle = self.store.conversation(conversation_id)?.lifecycle;
        let name = match name.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => {
                if self.find(conversation_id, name)?.is_some() {
                    return Err(CheckpointError::DuplicateName {
                        conversation_id: conversation_id.to_string(),
                        name: name.to_string(),
                    });
                }
                name.to_string()
            }
            None => self.generated_name(conversation_id, "checkpoint")?,
        };

        self.save(conversation_id, name, turns, lifecycle)
    }

    /// Snapshot taken before a repair deletes turns. Skips validation since
    /// the history is known to be broken; restoring it brings the damage back.
    pub(crate) fn create_pre_repair(
        &self,
        guard: &ConversationGuard,
        turns: &[StoredTurn],
    ) -> Result<Checkpoint, CheckpointError> {
        let conversation_id = guard.conversation_id();
        let name = self.generated_name(conversation_id, "pre-repair")?;
        self.save(
            conversation_id,
            name,
            turns.to_vec(),
            LifecycleState::NeedsCleanup,
        )
    }

    /// Rolls the conversation back to `name`. Returns whether the turn
    /// sequence changed.
    pub fn restore(&self, guard: &ConversationGuard, name: &str) -> Result<bool, CheckpointError> {
        let conversation_id = guard.conversation_id();
        let checkpoint =
            self.find(conversation_id, name)?
                .ok_or_else(|| CheckpointError::NotFound {
                    conversation_id: conversation_id.to_string(),
                    name: name.to_string(),
                })?;

        let current = self.store.turns(conversation_id)?;
        let snapshot_intact = checkpoint
            .turns_snapshot
            .iter()
            .all(|snap| current.iter().any(|turn| turn.seq == snap.seq));

        let changed = if snapshot_intact {
            self.store
                .delete_turns_after(conversation_id, checkpoint.last_seq)?
                > 0
        } else {
            let seeded = checkpoint
                .turns_snapshot
                .iter()
                .map(|snap| NewTurn {
                    turn: snap.turn.clone(),
                    provenance: snap.provenance.clone(),
                })
                .collect();
            self.store.replace_turns(conversation_id, seeded)?;
            true
        };

        let mut conversation = self.store.conversation(conversation_id)?;
        conversation.mark_stable(OffsetDateTime::now_utc());
        self.store.save_conversation(&conversation)?;

        tracing::info!(
            conversation_id,
            checkpoint = name,
            reseeded = !snapshot_intact,
            changed,
            "restored checkpoint"
        );
        Ok(changed)
    }

    /// Most recent first.
    pub fn list(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        Ok(self
            .store
            .checkpoints(conversation_id)?
            .iter()
            .rev()
            .take(limit)
            .map(Checkpoint::summary)
            .collect())
    }

    fn save(
        &self,
        conversation_id: &str,
        name: String,
        turns: Vec<StoredTurn>,
        lifecycle_state: LifecycleState,
    ) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint {
            name,
            created_at: OffsetDateTime::now_utc(),
            last_seq: turns.last().map_or(0, |turn| turn.seq),
            turn_count: turns.len(),
            tool_call_count: turns.iter().map(|turn| turn.turn.tool_calls.len()).sum(),
            lifecycle_state,
            context_summary: summarize(&turns),
            turns_snapshot: turns,
        };
        self.store
            .save_checkpoint(conversation_id, checkpoint.clone())?;
        tracing::info!(
            conversation_id,
            checkpoint = %checkpoint.name,
            turn_count = checkpoint.turn_count,
            "created checkpoint"
        );

        self.prune(conversation_id)?;
        Ok(checkpoint)
    }

    fn prune(&self, conversation_id: &str) -> Result<(), CheckpointError> {
        let checkpoints = self.store.checkpoints(conversation_id)?;
        let excess = checkpoints.len().saturating_sub(self.history_limit);
        for checkpoint in checkpoints.iter().take(excess) {
            self.store
                .delete_checkpoint(conversation_id, &checkpoint.name)?;
            tracing::debug!(conversation_id, checkpoint = %checkpoint.name, "pruned checkpoint");
        }
        Ok(())
    }

    fn find(&self, conversation_id: &str, name: &str) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .store
            .checkpoints(conversation_id)?
            .into_iter()
            .find(|checkpoint| checkpoint.name == name))
    }

    fn generated_name(&self, conversation_id: &str, prefix: &str) -> Result<String, StoreError> {
        let now = OffsetDateTime::now_utc();
        let stamp = now
            .format(&Rfc3339)
            .unwrap_or_else(|_| now.unix_timestamp_nanos().to_string());
        let base = format!("{prefix}-{stamp}");

        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.find(conversation_id, &candidate)?.is_some() {
            candidate = format!("{base}-{suffix}");
            suffix += 1;
        }
        Ok(candidate)
    }
}

fn summarize(turns: &[StoredTurn]) -> String {
    let count = |role: Role| turns.iter().filter(|turn| turn.role() == role).count();
    format!(
        "{} turns ({} user, {} assistant, {} tool, {} system)",
        turns.len(),
        count(Role::User),
        count(Role::Assistant),
        count(Role::Tool),
        count(Role::System)
    )
}

#[cfg(test)]
mod tests {
    use completion_provider::{ToolInvocation, Turn};
    use conversation_store::InMemoryConversationStore;
    use serde_json::json;

    use super::*;
    use crate::locks::ConversationLocks;

    fn setup(limit: usize) -> (Arc<InMemoryConversationStore>, CheckpointManager, String) {
        let store = Arc::new(InMemoryConversationStore::new());
        let id = store
            .create_conversation("owner-1", None)
            .expect("conversation")
            .id;
        let manager = CheckpointManager::new(
            store.clone(),
            Arc::new(IntegrityValidator::default()),
            limit,
        );
        (store, manager, id)
    }

    #[tokio::test]
    async fn create_counts_turns_and_tool_calls() {
        let (store, manager, id) = setup(10);
        store
            .append_turns(
                &id,
                vec![
                    Turn::user("hi").into(),
                    Turn::assistant_with_tool_calls(
                        None,
                        vec![ToolInvocation::new("call_1", "create_list", json!({}))],
                    )
                    .into(),
                    Turn::tool_result("call_1", "ok").into(),
                ],
            )
            .expect("append");
        let locks = ConversationLocks::new();
        let guard = locks.lock(&id).await;

        let checkpoint = manager.create(&guard, Some("first")).expect("create");

        assert_eq!(checkpoint.turn_count, 3);
        assert_eq!(checkpoint.tool_call_count, 1);
        assert_eq!(checkpoint.last_seq, 3);
        assert_eq!(checkpoint.lifecycle_state, LifecycleState::Stable);
        assert!(checkpoint.context_summary.starts_with("3 turns"));
    }

    #[tokio::test]
    async fn create_rejects_invalid_history_and_duplicate_names() {
        let (store, manager, id) = setup(10);
        let locks = ConversationLocks::new();
        let guard = locks.lock(&id).await;
        manager.create(&guard, Some("a")).expect("empty history is valid");

        assert!(matches!(
            manager.create(&guard, Some("a")),
            Err(CheckpointError::DuplicateName { .. })
        ));

        store
            .append_turn(&id, Turn::tool_result("call_1", "orphan"))
            .expect("append");
        assert!(matches!(
            manager.create(&guard, None),
            Err(CheckpointError::InvalidConversation { .. })
        ));
    }

    #[tokio::test]
    async fn history_is_pruned_to_limit() {
        let (_store, manager, id) = setup(2);
        let locks = ConversationLocks::new();
        let guard = locks.lock(&id).await;

        for name in ["a", "b", "c"] {
            manager.create(&guard, Some(name)).expect("create");
        }

        let names: Vec<String> = manager
            .list(&id, 10)
            .expect("list")
            .into_iter()
            .map(|summary| summary.name)
            .collect();
        assert_eq!(names, vec!["c".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn restore_unknown_name_fails() {
        let (_store, manager, id) = setup(10);
        let locks = ConversationLocks::new();
        let guard = locks.lock(&id).await;

        assert!(matches!(
            manager.restore(&guard, "missing"),
            Err(CheckpointError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn generated_names_do_not_collide() {
        let (_store, manager, id) = setup(10);
        let locks = ConversationLocks::new();
        let guard = locks.lock(&id).await;

        let first = manager.create(&guard, None).expect("first");
        let second = manager.create(&guard, None).expect("second");

        assert!(first.name.starts_with("checkpoint-"));
        assert_ne!(first.name, second.name);
    }
}
