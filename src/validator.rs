//! Structural checks over an ordered turn sequence.
//!
//! An exchange opens at an assistant turn carrying tool invocations and
//! stays open while tool turns answer it. Any other turn closes it; an
//! exchange closed with unanswered invocations is incomplete.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use completion_provider::{Role, Turn};
use conversation_store::StoredTurn;
use thiserror::Error;
use time::OffsetDateTime;

use crate::id_policy::{PrefixedIdPolicy, ToolCallIdPolicy};

/// A protocol violation at `index` in the validated sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityViolation {
    #[error("integrity violation: tool turn {index} does not follow an assistant turn with tool calls")]
    ToolWithoutInvocations { index: usize },
    #[error("integrity violation: tool turn {index} has a missing or malformed tool_call_id {reference:?}")]
    MalformedToolReference {
        index: usize,
        reference: Option<String>,
    },
    #[error("integrity violation: tool turn {index} references tool_call_id '{reference}' that matches no open tool call")]
    UnmatchedToolReference { index: usize, reference: String },
    #[error("integrity violation: assistant turn {index} has unanswered tool calls {missing:?}")]
    IncompleteToolExchange { index: usize, missing: Vec<String> },
    #[error("integrity violation: assistant turn {index} carries a malformed or duplicate tool call id '{id}'")]
    InvalidInvocationId { index: usize, id: String },
}

impl IntegrityViolation {
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::ToolWithoutInvocations { index }
            | Self::MalformedToolReference { index, .. }
            | Self::UnmatchedToolReference { index, .. }
            | Self::IncompleteToolExchange { index, .. }
            | Self::InvalidInvocationId { index, .. } => *index,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolWithoutInvocations { .. } => "tool_without_invocations",
            Self::MalformedToolReference { .. } => "malformed_tool_reference",
            Self::UnmatchedToolReference { .. } => "unmatched_tool_reference",
            Self::IncompleteToolExchange { .. } => "incomplete_tool_exchange",
            Self::InvalidInvocationId { .. } => "invalid_invocation_id",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Flags violations without raising; used while an exchange may be in flight.
    Basic,
    /// Raises on the first violation.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub mode: ValidationMode,
    pub violations: Vec<IntegrityViolation>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    policy: Arc<dyn ToolCallIdPolicy>,
    recency_window: Duration,
}

impl IntegrityValidator {
    #[must_use]
    pub fn new(policy: Arc<dyn ToolCallIdPolicy>, recency_window: Duration) -> Self {
        Self {
            policy,
            recency_window,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<dyn ToolCallIdPolicy> {
        &self.policy
    }

    pub fn is_well_formed_reference(&self, reference: Option<&str>) -> bool {
        reference.is_some_and(|id| self.policy.is_well_formed(id))
    }

    /// Every violation in `turns`, in sequence order.
    pub fn violations<T: AsRef<Turn>>(&self, turns: &[T]) -> Vec<IntegrityViolation> {
        let mut walker = ExchangeWalker::new(self);
        let mut found = Vec::new();
        for (index, turn) in turns.iter().enumerate() {
            walker.step(index, turn.as_ref(), &mut found);
        }
        walker.finish(&mut found);
        found.sort_by_key(IntegrityViolation::index);
        found
    }

    /// First violation as an error.
    pub fn check<T: AsRef<Turn>>(&self, turns: &[T]) -> Result<(), IntegrityViolation> {
        match self.violations(turns).into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    pub fn is_valid<T: AsRef<Turn>>(&self, turns: &[T]) -> bool {
        self.violations(turns).is_empty()
    }

    /// Basic while the newest user turn is inside the recency window.
    pub fn mode_at(&self, turns: &[StoredTurn], now: OffsetDateTime) -> ValidationMode {
        let last_user = turns
            .iter()
            .rev()
            .find(|turn| turn.role() == Role::User);
        match last_user {
            Some(turn) if now - turn.created_at < self.recency_window => ValidationMode::Basic,
            _ => ValidationMode::Full,
        }
    }

    pub fn validate(
        &self,
        turns: &[StoredTurn],
        now: OffsetDateTime,
    ) -> Result<ValidationReport, IntegrityViolation> {
        let mode = self.mode_at(turns, now);
        let violations = self.violations(turns);

        match mode {
            ValidationMode::Full => {
                if let Some(first) = violations.into_iter().next() {
                    return Err(first);
                }
                Ok(ValidationReport {
                    mode,
                    violations: Vec::new(),
                })
            }
            ValidationMode::Basic => {
                for violation in &violations {
                    tracing::warn!(
                        kind = violation.kind(),
                        index = violation.index(),
                        "flagged integrity violation during active exchange"
                    );
                }
                Ok(ValidationReport { mode, violations })
            }
        }
    }

    /// Length of the longest prefix that validates and leaves no exchange open.
    pub fn longest_valid_prefix<T: AsRef<Turn>>(&self, turns: &[T]) -> usize {
        let mut walker = ExchangeWalker::new(self);
        let mut found = Vec::new();
        let mut valid_len = 0;

        for (index, turn) in turns.iter().enumerate() {
            walker.step(index, turn.as_ref(), &mut found);
            if !found.is_empty() {
                break;
            }
            if walker.at_rest() {
                valid_len = index + 1;
            }
        }

        valid_len
    }
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new(Arc::new(PrefixedIdPolicy::default()), Duration::from_secs(120))
    }
}

struct OpenExchange {
    index: usize,
    pending: Vec<String>,
}

struct ExchangeWalker<'a> {
    validator: &'a IntegrityValidator,
    open: Option<OpenExchange>,
    seen_ids: HashSet<String>,
}

impl<'a> ExchangeWalker<'a> {
    fn new(validator: &'a IntegrityValidator) -> Self {
        Self {
            validator,
            open: None,
            seen_ids: HashSet::new(),
        }
    }

    fn at_rest(&self) -> bool {
        self.open
            .as_ref()
            .map_or(true, |exchange| exchange.pending.is_empty())
    }

    fn step(&mut self, index: usize, turn: &Turn, found: &mut Vec<IntegrityViolation>) {
        match turn.role {
            Role::Tool => self.answer(index, turn, found),
            Role::Assistant => {
                self.close(found);
                for invocation in &turn.tool_calls {
                    let well_formed = self.validator.policy.is_well_formed(&invocation.id);
                    let fresh = self.seen_ids.insert(invocation.id.clone());
                    if !well_formed || !fresh {
                        found.push(IntegrityViolation::InvalidInvocationId {
                            index,
                            id: invocation.id.clone(),
                        });
                    }
                }
                if turn.has_tool_calls() {
                    self.open = Some(OpenExchange {
                        index,
                        pending: turn.tool_calls.iter().map(|call| call.id.clone()).collect(),
                    });
                }
            }
            Role::User | Role::System => self.close(found),
        }
    }

    fn answer(&mut self, index: usize, turn: &Turn, found: &mut Vec<IntegrityViolation>) {
        let reference = turn.tool_call_id.as_deref();
        if !self.validator.is_well_formed_reference(reference) {
            found.push(IntegrityViolation::MalformedToolReference {
                index,
                reference: reference.map(str::to_string),
            });
            return;
        }
        let reference = reference.unwrap_or_default();

        let Some(exchange) = self.open.as_mut() else {
            found.push(IntegrityViolation::ToolWithoutInvocations { index });
            return;
        };
        match exchange.pending.iter().position(|id| id == reference) {
            Some(position) => {
                exchange.pending.remove(position);
            }
            None => found.push(IntegrityViolation::UnmatchedToolReference {
                index,
                reference: reference.to_string(),
            }),
        }
    }

    fn close(&mut self, found: &mut Vec<IntegrityViolation>) {
        if let Some(exchange) = self.open.take() {
            if !exchange.pending.is_empty() {
                found.push(IntegrityViolation::IncompleteToolExchange {
                    index: exchange.index,
                    missing: exchange.pending,
                });
            }
        }
    }

    fn finish(mut self, found: &mut Vec<IntegrityViolation>) {
        self.close(found);
    }
}
