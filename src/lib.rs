//! Integrity and recovery engine for tool-calling LLM conversations.
//!
//! Keeps a stored turn sequence protocol-valid and recovers from remote
//! failures.
//!
//! # Public API Overview
//! - Drive turns through [`ConversationEngine::send_user_message`], which
//!   validates, calls the remote client, runs the tool loop and recovers.
//! - Check and clean histories with [`IntegrityValidator`] and
//!   [`SequenceRepairer`].
//! - Snapshot and roll back with [`CheckpointManager`]; move to a healthy
//!   copy with [`BranchManager`].
//! - Map failures to a [`RecoverySignal`] via [`ErrorClassifier`] and
//!   [`RecoveryOrchestrator`]; the caller branches on `action` only.
//!
//! Destructive operations require a [`ConversationGuard`] from
//! [`ConversationLocks`].

pub mod backoff;
pub mod branch;
mod cancel;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod id_policy;
pub mod locks;
pub mod logging;
pub mod recovery;
pub mod repair;
pub mod resilient;
pub mod validator;

pub use crate::backoff::BackoffPolicy;
pub use crate::branch::{
    BranchError, BranchManager, MergeReport, MergeStrategy, BRANCH_OF_PREFIX, MERGED_FROM_PREFIX,
};
pub use crate::checkpoint::{CheckpointError, CheckpointManager};
pub use crate::circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use crate::classifier::{
    Classification, ClassificationRule, ClassificationTable, ErrorCategory, ErrorClassifier,
    RecoveryStrategy, Severity,
};
pub use crate::config::EngineConfig;
pub use crate::engine::{ConversationEngine, ConversationEngineBuilder, TurnOutcome};
pub use crate::error::EngineError;
pub use crate::id_policy::{NonEmptyIdPolicy, PrefixedIdPolicy, ToolCallIdPolicy};
pub use crate::locks::{ConversationGuard, ConversationLocks};
pub use crate::recovery::{
    RecoveryAction, RecoveryBudgets, RecoveryContext, RecoveryOrchestrator, RecoveryPolicy,
    RecoverySignal,
};
pub use crate::repair::{RepairError, RepairPlan, RepairReport, SequenceRepairer};
pub use crate::resilient::{CallError, HealthSnapshot, ResilientCompletionClient};
pub use crate::validator::{
    IntegrityValidator, IntegrityViolation, ValidationMode, ValidationReport,
};
