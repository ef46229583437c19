//! Expression errors
//!
//! Every failure the parser, the function catalog or an `ExpressionHost` can
//! raise. `UnresolvedSymbol` is the only recoverable one: the caller may retry
//! once the symbol is bound.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("Invalid expression at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Unknown function '{name}' at offset {position}")]
    UnknownFunction { name: String, position: usize },

    #[error("Symbol '{symbol}' is not bound yet")]
    UnresolvedSymbol { symbol: String },

    #[error("Expected {expected} for {context}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Integer overflow in {operation}")]
    NumericOverflow { operation: String },

    #[error("Function '{function}' expects {expected} argument(s), got {actual}")]
    ArgumentCount {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("Invalid argument for '{function}': {message}")]
    InvalidArgument { function: String, message: String },

    #[error("Property '{property}' does not exist")]
    MissingProperty { property: String },

    #[error("Index {index} is out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("Parameter '{name}' is not declared")]
    UnknownParameter { name: String },

    #[error("Variable '{name}' is not declared")]
    UnknownVariable { name: String },

    #[error("Variable '{name}' refers back to itself")]
    CyclicVariableReference { name: String },

    #[error("Required parameter '{name}' has no value")]
    MissingRequiredParameter { name: String },

    #[error("Resource '{symbol}' is not deployed because its condition is false")]
    ConditionFalse { symbol: String },

    #[error("Resource '{symbol}' failed to expand")]
    DependencyFailed { symbol: String },

    #[error("copyIndex() used outside of {}", loop_name.as_deref().map(|n| format!("copy loop '{}'", n)).unwrap_or_else(|| "a copy loop".to_string()))]
    CopyIndexUnavailable { loop_name: Option<String> },

    #[error("Lambda variable '{name}' is not in scope")]
    UnknownLambdaVariable { name: String },

    #[error("Malformed template: {message}")]
    Malformed { message: String },
}

impl ExpressionError {
    pub fn is_unresolved(&self) -> bool {
        matches!(self, ExpressionError::UnresolvedSymbol { .. })
    }

    pub fn invalid_argument(function: &str, message: impl Into<String>) -> Self {
        ExpressionError::InvalidArgument {
            function: function.to_string(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        found: &serde_json::Value,
    ) -> Self {
        ExpressionError::TypeMismatch {
            context: context.into(),
            expected: expected.into(),
            found: crate::value::type_name(found).to_string(),
        }
    }

    pub fn overflow(operation: impl Into<String>) -> Self {
        ExpressionError::NumericOverflow {
            operation: operation.into(),
        }
    }
}

pub type ExprResult<T> = Result<T, ExpressionError>;
