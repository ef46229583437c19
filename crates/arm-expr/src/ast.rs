//! Expression AST
//!
//! A template string is either a plain literal or a single bracketed
//! expression. Expressions are a small tree of literals, function calls and
//! accessor chains. Spans are byte offsets into the original template string
//! (the leading `[` is offset 0).

use serde::{Deserialize, Serialize};

/// Byte range in the source template string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Result of classifying a JSON string value
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateString {
    /// Not an expression; used verbatim (with `[[` already unescaped)
    Literal(String),
    /// A `[...]` expression
    Expression(Expr),
}

/// A parsed expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `'text'` with `''` already unescaped
    String(String),
    /// Integer literal kept as source text; overflow is reported when evaluated
    Integer { literal: String, span: Span },
    Bool(bool),
    Null,
    Call(FunctionCall),
    /// `target.name`
    Property {
        target: Box<Expr>,
        name: String,
        span: Span,
    },
    /// `target[index]`
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
}

/// `name(args...)` or `namespace.name(args...)`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Set for user-defined functions
    pub namespace: Option<String>,
    pub name: String,
    pub args: Vec<Expr>,
    pub span: Span,
}

impl FunctionCall {
    /// Name used for catalog lookup
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.namespace.is_none() && self.name.eq_ignore_ascii_case(name)
    }
}

impl Expr {
    pub fn span(&self) -> Option<Span> {
        match self {
            Expr::Integer { span, .. } | Expr::Property { span, .. } | Expr::Index { span, .. } => {
                Some(*span)
            }
            Expr::Call(call) => Some(call.span),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&FunctionCall> {
        match self {
            Expr::Call(call) => Some(call),
            _ => None,
        }
    }

    /// Visit every function call in this tree, outermost first
    pub fn visit_calls<'a>(&'a self, visit: &mut dyn FnMut(&'a FunctionCall)) {
        match self {
            Expr::Call(call) => {
                visit(call);
                for arg in &call.args {
                    arg.visit_calls(visit);
                }
            }
            Expr::Property { target, .. } => target.visit_calls(visit),
            Expr::Index { target, index, .. } => {
                target.visit_calls(visit);
                index.visit_calls(visit);
            }
            Expr::String(_) | Expr::Integer { .. } | Expr::Bool(_) | Expr::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(FunctionCall {
            namespace: None,
            name: name.to_string(),
            args,
            span: Span::default(),
        })
    }

    #[test]
    fn test_visit_calls_outermost_first() {
        let expr = Expr::Property {
            target: Box::new(call(
                "concat",
                vec![call("parameters", vec![Expr::String("a".into())])],
            )),
            name: "x".into(),
            span: Span::default(),
        };

        let mut names = Vec::new();
        expr.visit_calls(&mut |c| names.push(c.name.clone()));
        assert_eq!(names, vec!["concat", "parameters"]);
    }

    #[test]
    fn test_qualified_name() {
        let udf = FunctionCall {
            namespace: Some("ns".into()),
            name: "greet".into(),
            args: vec![],
            span: Span::default(),
        };
        assert_eq!(udf.qualified_name(), "ns.greet");
        assert!(!udf.is_named("greet"));
    }
}
