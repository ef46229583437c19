//! Template function catalog
//!
//! Functions are looked up by lower-cased name. Most are eager: arguments are
//! evaluated first and the implementation receives values. A few control
//! evaluation themselves (`if`, `and`, `or` and the lambda family) and are
//! handled by the evaluator.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;
use crate::value::type_name;

mod array;
mod comparison;
mod deployment;
mod logical;
mod numeric;
mod resource;
mod string;

pub use string::{guid_from_args, unique_string};

pub(crate) type FunctionImpl = fn(&mut dyn ExpressionHost, &Args<'_>) -> ExprResult<Value>;

/// Functions that decide for themselves which arguments to evaluate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpecialForm {
    If,
    And,
    Or,
    Lambda,
    LambdaVariables,
    Map,
    Filter,
    Reduce,
    Sort,
}

pub(crate) enum Dispatch {
    Eager(FunctionImpl),
    Special(SpecialForm),
}

pub(crate) type Registry = HashMap<&'static str, Dispatch>;

static CATALOG: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::new();
    array::register(&mut registry);
    comparison::register(&mut registry);
    deployment::register(&mut registry);
    logical::register(&mut registry);
    numeric::register(&mut registry);
    resource::register(&mut registry);
    string::register(&mut registry);

    registry.insert("if", Dispatch::Special(SpecialForm::If));
    registry.insert("and", Dispatch::Special(SpecialForm::And));
    registry.insert("or", Dispatch::Special(SpecialForm::Or));
    registry.insert("lambda", Dispatch::Special(SpecialForm::Lambda));
    registry.insert(
        "lambdavariables",
        Dispatch::Special(SpecialForm::LambdaVariables),
    );
    registry.insert("map", Dispatch::Special(SpecialForm::Map));
    registry.insert("filter", Dispatch::Special(SpecialForm::Filter));
    registry.insert("reduce", Dispatch::Special(SpecialForm::Reduce));
    registry.insert("sort", Dispatch::Special(SpecialForm::Sort));
    registry
});

/// `listKeys`, `listSecrets`, `listAccountSas` and every other `list*` call
static LIST: Dispatch = Dispatch::Eager(resource::list);

pub(crate) fn lookup(name: &str) -> Option<&'static Dispatch> {
    let name = name.to_ascii_lowercase();
    CATALOG
        .get(name.as_str())
        .or_else(|| name.starts_with("list").then_some(&LIST))
}

/// True if `name` is a built-in function (case-insensitive)
pub fn is_known_function(name: &str) -> bool {
    lookup(name).is_some()
}

/// All built-in function names, lower-cased and sorted
pub fn function_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = CATALOG.keys().copied().collect();
    names.sort_unstable();
    names
}

// ============================================================================
// Argument access
// ============================================================================

/// Evaluated arguments of one call, with typed accessors that report errors
/// against the calling function
pub struct Args<'a> {
    function: &'a str,
    values: Vec<Value>,
}

impl<'a> Args<'a> {
    pub fn new(function: &'a str, values: Vec<Value>) -> Self {
        Self { function, values }
    }

    pub fn function(&self) -> &str {
        self.function
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Require between `min` and `max` arguments (`None` = unbounded)
    pub fn expect(&self, min: usize, max: Option<usize>) -> ExprResult<()> {
        let n = self.values.len();
        let ok = n >= min && max.map_or(true, |m| n <= m);
        if ok {
            return Ok(());
        }
        let expected = match max {
            Some(m) if m == min => min.to_string(),
            Some(m) => format!("{}-{}", min, m),
            None => format!("at least {}", min),
        };
        Err(ExpressionError::ArgumentCount {
            function: self.function.to_string(),
            expected,
            actual: n,
        })
    }

    pub fn exactly(&self, n: usize) -> ExprResult<()> {
        self.expect(n, Some(n))
    }

    pub fn value(&self, index: usize) -> ExprResult<&Value> {
        self.values
            .get(index)
            .ok_or_else(|| ExpressionError::ArgumentCount {
                function: self.function.to_string(),
                expected: format!("at least {}", index + 1),
                actual: self.values.len(),
            })
    }

    fn mismatch(&self, index: usize, expected: &str, found: &Value) -> ExpressionError {
        ExpressionError::TypeMismatch {
            context: format!("argument {} of '{}'", index + 1, self.function),
            expected: expected.to_string(),
            found: type_name(found).to_string(),
        }
    }

    pub fn string(&self, index: usize) -> ExprResult<&str> {
        match self.value(index)? {
            Value::String(s) => Ok(s),
            other => Err(self.mismatch(index, "string", other)),
        }
    }

    pub fn int(&self, index: usize) -> ExprResult<i64> {
        match self.value(index)? {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ExpressionError::overflow(format!("argument of '{}'", self.function))),
            other => Err(self.mismatch(index, "int", other)),
        }
    }

    pub fn bool(&self, index: usize) -> ExprResult<bool> {
        match self.value(index)? {
            Value::Bool(b) => Ok(*b),
            other => Err(self.mismatch(index, "bool", other)),
        }
    }

    pub fn array(&self, index: usize) -> ExprResult<&Vec<Value>> {
        match self.value(index)? {
            Value::Array(a) => Ok(a),
            other => Err(self.mismatch(index, "array", other)),
        }
    }

    pub fn object(&self, index: usize) -> ExprResult<&Map<String, Value>> {
        match self.value(index)? {
            Value::Object(o) => Ok(o),
            other => Err(self.mismatch(index, "object", other)),
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
