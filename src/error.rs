//! Error types for tree operations

use crate::numbering::Violation;
use crate::source::SourceError;
use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a failure, for callers deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Range invariant broken in a way renumbering cannot fix
    InvariantViolation,
    /// Request rejected before any row changed
    BusinessRule,
    /// Network failure that exhausted its retries
    TransientIo,
    NotFound,
    Storage,
    Cancelled,
    Config,
    /// Background job died without reporting a result
    Internal,
}

/// Machine-readable reason for a rejected mutation. The string form is the
/// localization key a caller renders a message from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleKey {
    CrossDefinition,
    SameNode,
    AlreadySynonymized,
    SynonymizeTargetHasChildren,
    SynonymizeTargetIsSynonym,
    NotASynonym,
    MoveCreatesCycle,
    MoveRoot,
    MergeRoot,
    MergeIntoDescendant,
    MergeIntoSynonym,
    RankNotBelowParent,
    EnforcedRankSkipped,
    NumberingRequired,
}

impl RuleKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKey::CrossDefinition => "tree.cross_definition",
            RuleKey::SameNode => "tree.same_node",
            RuleKey::AlreadySynonymized => "tree.synonymize.already_synonymized",
            RuleKey::SynonymizeTargetHasChildren => "tree.synonymize.target_has_children",
            RuleKey::SynonymizeTargetIsSynonym => "tree.synonymize.target_is_synonym",
            RuleKey::NotASynonym => "tree.desynonymize.not_a_synonym",
            RuleKey::MoveCreatesCycle => "tree.move.creates_cycle",
            RuleKey::MoveRoot => "tree.move.root",
            RuleKey::MergeRoot => "tree.merge.root",
            RuleKey::MergeIntoDescendant => "tree.merge.into_descendant",
            RuleKey::MergeIntoSynonym => "tree.merge.into_synonym",
            RuleKey::RankNotBelowParent => "tree.rank_not_below_parent",
            RuleKey::EnforcedRankSkipped => "tree.enforced_rank_skipped",
            RuleKey::NumberingRequired => "tree.numbering_required",
        }
    }
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Tree node {0} not found")]
    NodeNotFound(i64),

    #[error("Tree definition {0} not found")]
    DefinitionNotFound(i64),

    /// Business-rule violation, rejected before any mutation
    #[error("{message} [{}]", .key.as_str())]
    Rule {
        key: RuleKey,
        node_ids: Vec<i64>,
        message: String,
    },

    /// Violations that survived a renumber: cycle, orphan or cross-definition pointer
    #[error("Tree definition {definition_id} is structurally corrupt: {} violation(s) remain after renumber", .violations.len())]
    Corrupt {
        definition_id: i64,
        violations: Vec<Violation>,
    },

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Import cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Import task failed: {0}")]
    Job(String),
}

impl TreeError {
    pub fn rule(key: RuleKey, node_ids: Vec<i64>, message: impl Into<String>) -> Self {
        TreeError::Rule { key, node_ids, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TreeError::Database(_) => ErrorKind::Storage,
            TreeError::NodeNotFound(_) | TreeError::DefinitionNotFound(_) => ErrorKind::NotFound,
            TreeError::Rule { .. } => ErrorKind::BusinessRule,
            TreeError::Corrupt { .. } => ErrorKind::InvariantViolation,
            TreeError::Source(_) => ErrorKind::TransientIo,
            TreeError::Cancelled => ErrorKind::Cancelled,
            TreeError::Config(_) => ErrorKind::Config,
            TreeError::Job(_) => ErrorKind::Internal,
        }
    }

    /// Localization key for rule violations
    pub fn key(&self) -> Option<&'static str> {
        match self {
            TreeError::Rule { key, .. } => Some(key.as_str()),
            TreeError::Corrupt { .. } => Some("tree.corrupt"),
            _ => None,
        }
    }

    /// Node ids the failure is about (empty when not node-specific)
    pub fn node_ids(&self) -> Vec<i64> {
        match self {
            TreeError::Rule { node_ids, .. } => node_ids.clone(),
            TreeError::NodeNotFound(id) => vec![*id],
            TreeError::Corrupt { violations, .. } => {
                let mut ids: Vec<i64> = violations.iter().map(|v| v.node_id).collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            _ => Vec::new(),
        }
    }
}

/// Serializable failure report for a request layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub key: Option<&'static str>,
    pub node_ids: Vec<i64>,
    pub message: String,
}

impl From<&TreeError> for FailureReport {
    fn from(err: &TreeError) -> Self {
        FailureReport {
            kind: err.kind(),
            key: err.key(),
            node_ids: err.node_ids(),
            message: err.to_string(),
        }
    }
}

pub type TreeResult<T> = Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_error_report() {
        let err = TreeError::rule(RuleKey::AlreadySynonymized, vec![7], "Node 'Felis' is already a synonym");
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert_eq!(err.key(), Some("tree.synonymize.already_synonymized"));

        let report = FailureReport::from(&err);
        assert_eq!(report.node_ids, vec![7]);
        assert!(report.message.contains("already a synonym"));
        assert!(report.message.contains("tree.synonymize.already_synonymized"));
    }

    #[test]
    fn test_not_found_carries_id() {
        let err = TreeError::NodeNotFound(42);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.node_ids(), vec![42]);
        assert_eq!(err.key(), None);
    }
}
