//! ARM template expression language
//!
//! This crate contains:
//! - AST types for bracketed template expressions
//! - A nom parser that records byte offsets for diagnostics
//! - The built-in function catalog
//! - An evaluator that reaches deployment state only through [`ExpressionHost`]
//!
//! It has no knowledge of templates, resources or deployments. Those live in
//! the `arm-expand` crate, which implements [`ExpressionHost`].

pub mod ast;
pub mod error;
pub mod eval;
pub mod functions;
pub mod host;
pub mod ids;
pub mod parser;
pub mod value;

pub use ast::{Expr, FunctionCall, Span, TemplateString};
pub use error::{ExprResult, ExpressionError};
pub use eval::{evaluate_template_string, Evaluator};
pub use functions::{function_names, guid_from_args, is_known_function, unique_string};
pub use host::{azure_cloud_environment, ExpressionHost, StaticHost};
pub use ids::{ResourceIdError, ScopeLevel};
pub use parser::{is_expression, parse_expression, parse_template_string};
