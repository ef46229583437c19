//! Expansion errors
//!
//! `ExpandError` is either structural (aborts the whole deployment tree) or
//! local to one resource or output (recorded as an [`ExpansionFailure`] while
//! siblings continue).

use std::fmt;

use arm_expr::ExpressionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::symbols::SymbolKind;

/// Coarse classification of every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnknownFunction,
    UnresolvedSymbol,
    SymbolKindConflict,
    CyclicDependency,
    CyclicVariableReference,
    MissingRequiredParameter,
    TypeMismatch,
    NumericOverflow,
    MalformedTemplate,
    /// A referenced resource failed or was skipped by its condition
    DependencyFailed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpandError {
    #[error("{pointer}: {source}")]
    Expression {
        /// JSON pointer of the value being evaluated
        pointer: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Symbol '{name}' is declared as {existing} and cannot be used as {requested}")]
    SymbolKindConflict {
        name: String,
        existing: SymbolKind,
        requested: SymbolKind,
    },

    #[error("Symbol '{name}' is already bound to '{id}'")]
    SymbolAlreadyBound { name: String, id: String },

    #[error("Symbol '{name}' is not declared")]
    UnknownSymbol { name: String },

    #[error("Index {index} of '{name}' is out of range ({len} bound)")]
    SymbolIndexOutOfRange {
        name: String,
        index: usize,
        len: usize,
    },

    #[error("Circular dependency detected: {}", ids.join(" → "))]
    CyclicDependency { ids: Vec<String> },

    #[error("Malformed template at {pointer}: {message}")]
    MalformedTemplate { pointer: String, message: String },

    #[error("Depends on '{dependency}' which failed to expand")]
    DependencyFailed { dependency: String },

    #[error("Nested deployment '{name}' exceeds the maximum depth of {max_depth}")]
    DepthExceeded { name: String, max_depth: usize },
}

impl ExpandError {
    pub fn malformed(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        ExpandError::MalformedTemplate {
            pointer: pointer.into(),
            message: message.into(),
        }
    }

    pub fn expression(pointer: impl Into<String>, source: ExpressionError) -> Self {
        ExpandError::Expression {
            pointer: pointer.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExpandError::Expression { source, .. } => expression_kind(source),
            ExpandError::SymbolKindConflict { .. } | ExpandError::SymbolAlreadyBound { .. } => {
                ErrorKind::SymbolKindConflict
            }
            ExpandError::UnknownSymbol { .. } => ErrorKind::UnresolvedSymbol,
            ExpandError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            ExpandError::SymbolIndexOutOfRange { .. }
            | ExpandError::MalformedTemplate { .. }
            | ExpandError::DepthExceeded { .. } => ErrorKind::MalformedTemplate,
            ExpandError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
        }
    }

    /// Structural errors abort the whole deployment tree
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExpandError::CyclicDependency { .. }
                | ExpandError::SymbolKindConflict { .. }
                | ExpandError::SymbolAlreadyBound { .. }
                | ExpandError::MalformedTemplate { .. }
                | ExpandError::DepthExceeded { .. }
        )
    }

    /// True when a retry after more resources are bound may succeed
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ExpandError::Expression { source, .. } if source.is_unresolved())
    }
}

fn expression_kind(error: &ExpressionError) -> ErrorKind {
    match error {
        ExpressionError::UnknownFunction { .. } => ErrorKind::UnknownFunction,
        ExpressionError::UnresolvedSymbol { .. } => ErrorKind::UnresolvedSymbol,
        ExpressionError::CyclicVariableReference { .. } => ErrorKind::CyclicVariableReference,
        ExpressionError::MissingRequiredParameter { .. } => ErrorKind::MissingRequiredParameter,
        ExpressionError::NumericOverflow { .. } => ErrorKind::NumericOverflow,
        ExpressionError::TypeMismatch { .. }
        | ExpressionError::ArgumentCount { .. }
        | ExpressionError::InvalidArgument { .. }
        | ExpressionError::MissingProperty { .. }
        | ExpressionError::IndexOutOfRange { .. } => ErrorKind::TypeMismatch,
        ExpressionError::ConditionFalse { .. } | ExpressionError::DependencyFailed { .. } => {
            ErrorKind::DependencyFailed
        }
        ExpressionError::Parse { .. }
        | ExpressionError::UnknownParameter { .. }
        | ExpressionError::UnknownVariable { .. }
        | ExpressionError::CopyIndexUnavailable { .. }
        | ExpressionError::UnknownLambdaVariable { .. }
        | ExpressionError::Malformed { .. } => ErrorKind::MalformedTemplate,
    }
}

/// What a failure is attached to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "camelCase")]
pub enum FailureSubject {
    Resource(String),
    Output(String),
}

impl fmt::Display for FailureSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSubject::Resource(name) => write!(f, "resource '{}'", name),
            FailureSubject::Output(name) => write!(f, "output '{}'", name),
        }
    }
}

/// A resource or output that could not be expanded; siblings were unaffected
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionFailure {
    pub deployment: String,
    pub subject: FailureSubject,
    pub error: ExpandError,
}

impl ExpansionFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for ExpansionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in deployment '{}': {}", self.subject, self.deployment, self.error)
    }
}

pub type Result<T> = std::result::Result<T, ExpandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let e = ExpandError::expression(
            "/resources/0/name",
            ExpressionError::NumericOverflow {
                operation: "add".into(),
            },
        );
        assert_eq!(e.kind(), ErrorKind::NumericOverflow);
        assert!(!e.is_structural());

        let e = ExpandError::CyclicDependency {
            ids: vec!["a".into(), "b".into()],
        };
        assert_eq!(e.kind(), ErrorKind::CyclicDependency);
        assert!(e.is_structural());
        assert_eq!(e.to_string(), "Circular dependency detected: a → b");
    }

    #[test]
    fn test_unresolved_is_retryable() {
        let e = ExpandError::expression(
            "/resources/1/properties",
            ExpressionError::UnresolvedSymbol { symbol: "vnet".into() },
        );
        assert!(e.is_unresolved());
        assert_eq!(e.kind(), ErrorKind::UnresolvedSymbol);
    }

    #[test]
    fn test_failure_display() {
        let f = ExpansionFailure {
            deployment: "main".into(),
            subject: FailureSubject::Output("endpoint".into()),
            error: ExpandError::DependencyFailed {
                dependency: "storage".into(),
            },
        };
        assert_eq!(
            f.to_string(),
            "output 'endpoint' in deployment 'main': Depends on 'storage' which failed to expand"
        );
    }
}
