use conversation_store::StoreError;
use thiserror::Error;

use crate::branch::BranchError;
use crate::checkpoint::CheckpointError;
use crate::repair::RepairError;
use crate::validator::IntegrityViolation;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("conversation {conversation_id} is archived")]
    ConversationArchived { conversation_id: String },
    #[error("conversation {conversation_id} cannot be merged into itself")]
    SelfMerge { conversation_id: String },
    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),
    #[error(transparent)]
    Repair(#[from] RepairError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Branch(#[from] BranchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
