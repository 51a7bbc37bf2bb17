//! Tool-call id format checks.
//!
//! Providers use different id schemes, so the check is a strategy object
//! shared by the validator, the repairer and the branch manager.

use std::fmt;

pub const DEFAULT_ID_PREFIX: &str = "call_";
pub const DEFAULT_ID_MAX_LEN: usize = 64;

pub trait ToolCallIdPolicy: fmt::Debug + Send + Sync {
    fn is_well_formed(&self, id: &str) -> bool;
}

/// Namespaced ids: fixed prefix, then a non-empty `[A-Za-z0-9_-]` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixedIdPolicy {
    prefix: String,
    max_len: usize,
}

impl PrefixedIdPolicy {
    #[must_use]
    pub fn new(prefix: impl Into<String>, max_len: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_len,
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Default for PrefixedIdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ID_PREFIX, DEFAULT_ID_MAX_LEN)
    }
}

impl ToolCallIdPolicy for PrefixedIdPolicy {
    fn is_well_formed(&self, id: &str) -> bool {
        if id.len() > self.max_len {
            return false;
        }
        let Some(suffix) = id.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        !suffix.is_empty()
            && suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

/// Accepts any id that is not blank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonEmptyIdPolicy;

impl ToolCallIdPolicy for NonEmptyIdPolicy {
    fn is_well_formed(&self, id: &str) -> bool {
        !id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_policy_accepts_namespaced_ids() {
        let policy = PrefixedIdPolicy::default();

        assert!(policy.is_well_formed("call_1"));
        assert!(policy.is_well_formed("call_AbC-9_x"));
    }

    #[test]
    fn prefixed_policy_rejects_malformed_ids() {
        let policy = PrefixedIdPolicy::default();

        assert!(!policy.is_well_formed(""));
        assert!(!policy.is_well_formed("call_"));
        assert!(!policy.is_well_formed("toolu_01"));
        assert!(!policy.is_well_formed("call_has space"));
        assert!(!policy.is_well_formed(&format!("call_{}", "x".repeat(60))));
    }

    #[test]
    fn custom_prefix_is_honored() {
        let policy = PrefixedIdPolicy::new("toolu_", 32);

        assert!(policy.is_well_formed("toolu_01abc"));
        assert!(!policy.is_well_formed("call_1"));
    }

    #[test]
    fn non_empty_policy_only_rejects_blank() {
        assert!(NonEmptyIdPolicy.is_well_formed("anything goes"));
        assert!(!NonEmptyIdPolicy.is_well_formed("  "));
    }
}
