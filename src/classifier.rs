//! Text-based failure classification.
//!
//! Upstream error types are not ours, so classification matches the error
//! message against an ordered, versioned rule table. First match wins.

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

pub const BUILTIN_TABLE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    ConversationStructure,
    NetworkError,
    ServiceUnavailable,
    AuthError,
    ValidationError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        Self::RateLimit,
        Self::ConversationStructure,
        Self::NetworkError,
        Self::ServiceUnavailable,
        Self::AuthError,
        Self::ValidationError,
        Self::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ConversationStructure => "conversation_structure",
            Self::NetworkError => "network_error",
            Self::ServiceUnavailable => "service_unavailable",
            Self::AuthError => "auth_error",
            Self::ValidationError => "validation_error",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn recoverable(self) -> bool {
        !matches!(self, Self::AuthError | Self::ValidationError)
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::RateLimit | Self::NetworkError => Severity::Low,
            Self::ConversationStructure | Self::Unknown => Severity::Medium,
            Self::ServiceUnavailable | Self::ValidationError => Severity::High,
            Self::AuthError => Severity::Critical,
        }
    }

    #[must_use]
    pub fn strategy(self) -> RecoveryStrategy {
        match self {
            Self::RateLimit | Self::NetworkError => RecoveryStrategy::Backoff,
            Self::ConversationStructure => RecoveryStrategy::RepairThenBranch,
            Self::ServiceUnavailable => RecoveryStrategy::CircuitBreakerRetry,
            Self::AuthError => RecoveryStrategy::UserIntervention,
            Self::ValidationError => RecoveryStrategy::UserCorrection,
            Self::Unknown => RecoveryStrategy::GenericBackoff,
        }
    }

    /// True when the failure suggests the remote dependency itself is down.
    /// Only these count toward opening a circuit breaker; the rest prove the
    /// remote answered.
    #[must_use]
    pub fn indicates_outage(self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::ServiceUnavailable | Self::Unknown
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Backoff,
    RepairThenBranch,
    CircuitBreakerRetry,
    UserIntervention,
    UserCorrection,
    GenericBackoff,
}

impl RecoveryStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backoff => "backoff",
            Self::RepairThenBranch => "repair_then_branch",
            Self::CircuitBreakerRetry => "circuit_breaker_retry",
            Self::UserIntervention => "user_intervention",
            Self::UserCorrection => "user_correction",
            Self::GenericBackoff => "generic_backoff",
        }
    }
}

/// Built-in rules, in match order.
pub const BUILTIN_RULES: [(&str, ErrorCategory); 6] = [
    (
        r"rate.?limit|too many requests|\b429\b|quota exceeded",
        ErrorCategory::RateLimit,
    ),
    (
        r"unauthori[sz]ed|invalid api key|authentication|\b401\b|\b403\b|forbidden",
        ErrorCategory::AuthError,
    ),
    (
        r"tool_call_id|tool call|messages with role 'tool'|must be a response to a preceding message|invalid message sequence|integrity violation|orphan",
        ErrorCategory::ConversationStructure,
    ),
    (
        r"service unavailable|\b503\b|\b502\b|overloaded|bad gateway|circuit open",
        ErrorCategory::ServiceUnavailable,
    ),
    (
        r"timed? ?out|timeout|connection (refused|reset|closed|failed)|network|dns|broken pipe",
        ErrorCategory::NetworkError,
    ),
    (
        r"invalid request|validation failed|invalid parameter|\b400\b|\b422\b|unprocessable",
        ErrorCategory::ValidationError,
    ),
];

#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pattern: Regex,
    category: ErrorCategory,
}

impl ClassificationRule {
    pub fn new(pattern: &str, category: ErrorCategory) -> Result<Self, regex::Error> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(Self { pattern, category })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.category
    }
}

/// Ordered (pattern, category) rules with a version tag.
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    version: u32,
    rules: Vec<ClassificationRule>,
}

impl ClassificationTable {
    pub fn from_rules(version: u32, rules: &[(&str, ErrorCategory)]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|(pattern, category)| ClassificationRule::new(pattern, *category))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { version, rules })
    }

    /// The built-in table. A rule that fails to compile is logged and left out.
    #[must_use]
    pub fn builtin() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .filter_map(|(pattern, category)| {
                match ClassificationRule::new(pattern, *category) {
                    Ok(rule) => Some(rule),
                    Err(error) => {
                        tracing::error!(%error, category = category.as_str(), "invalid builtin classification rule");
                        None
                    }
                }
            })
            .collect();
        Self {
            version: BUILTIN_TABLE_VERSION,
            rules,
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }
}

impl Default for ClassificationTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub message: String,
    /// Pattern of the rule that matched; `None` for `unknown`.
    pub matched_pattern: Option<String>,
    pub table_version: u32,
}

impl Classification {
    #[must_use]
    pub fn recoverable(&self) -> bool {
        self.category.recoverable()
    }

    #[must_use]
    pub fn strategy(&self) -> RecoveryStrategy {
        self.category.strategy()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    table: ClassificationTable,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(table: ClassificationTable) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn table(&self) -> &ClassificationTable {
        &self.table
    }

    pub fn classify(&self, message: &str) -> Classification {
        let matched = self
            .table
            .rules
            .iter()
            .find(|rule| rule.pattern.is_match(message));

        Classification {
            category: matched.map_or(ErrorCategory::Unknown, ClassificationRule::category),
            message: message.to_string(),
            matched_pattern: matched.map(|rule| rule.pattern().to_string()),
            table_version: self.table.version,
        }
    }

    /// Classifies any error by its display text.
    pub fn classify_error(&self, error: &dyn std::error::Error) -> Classification {
        self.classify(&error.to_string())
    }
}
