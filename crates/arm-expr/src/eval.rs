//! Expression evaluator
//!
//! Walks an [`Expr`] against an [`ExpressionHost`]. Eager catalog functions
//! receive evaluated arguments; `if`, `and`, `or` and the lambda family are
//! evaluated here because they control which arguments run.

use std::cmp::Ordering;

use serde_json::Value;

use crate::ast::{Expr, FunctionCall, TemplateString};
use crate::error::{ExprResult, ExpressionError};
use crate::functions::{self, Args, Dispatch, SpecialForm};
use crate::host::ExpressionHost;
use crate::parser::parse_template_string;
use crate::value::{get_property, mock_member, to_display_string, type_name};

pub struct Evaluator<'h> {
    host: &'h mut dyn ExpressionHost,
    /// Innermost scope last
    lambda_scopes: Vec<Vec<(String, Value)>>,
}

impl<'h> Evaluator<'h> {
    pub fn new(host: &'h mut dyn ExpressionHost) -> Self {
        Self {
            host,
            lambda_scopes: Vec::new(),
        }
    }

    /// Evaluate a JSON string value: literals come back unchanged
    pub fn evaluate_str(&mut self, input: &str) -> ExprResult<Value> {
        match parse_template_string(input)? {
            TemplateString::Literal(s) => Ok(Value::String(s)),
            TemplateString::Expression(expr) => self.evaluate(&expr),
        }
    }

    pub fn evaluate(&mut self, expr: &Expr) -> ExprResult<Value> {
        match expr {
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Integer { literal, .. } => literal
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ExpressionError::overflow(format!("integer literal {}", literal))),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Call(call) => self.call(call),
            Expr::Property { target, name, .. } => {
                let target = self.evaluate(target)?;
                property(&target, name)
            }
            Expr::Index { target, index, .. } => {
                let target = self.evaluate(target)?;
                let index = self.evaluate(index)?;
                element(&target, &index)
            }
        }
    }

    fn call(&mut self, call: &FunctionCall) -> ExprResult<Value> {
        if let Some(namespace) = &call.namespace {
            let args = self.evaluate_args(call)?;
            return self.host.user_function(namespace, &call.name, args);
        }

        let dispatch =
            functions::lookup(&call.name).ok_or_else(|| ExpressionError::UnknownFunction {
                name: call.name.clone(),
                position: call.span.start,
            })?;

        match dispatch {
            Dispatch::Eager(f) => {
                let values = self.evaluate_args(call)?;
                let args = Args::new(&call.name, values);
                f(&mut *self.host, &args)
            }
            Dispatch::Special(form) => self.special(*form, call),
        }
    }

    fn evaluate_args(&mut self, call: &FunctionCall) -> ExprResult<Vec<Value>> {
        call.args.iter().map(|a| self.evaluate(a)).collect()
    }

    fn expect_args(&self, call: &FunctionCall, min: usize, max: Option<usize>) -> ExprResult<()> {
        Args::new(&call.name, vec![Value::Null; call.args.len()]).expect(min, max)
    }

    fn evaluate_bool(&mut self, call: &FunctionCall, index: usize) -> ExprResult<bool> {
        match self.evaluate(&call.args[index])? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::type_mismatch(
                format!("argument {} of '{}'", index + 1, call.name),
                "bool",
                &other,
            )),
        }
    }

    // ========================================================================
    // Special forms
    // ========================================================================

    fn special(&mut self, form: SpecialForm, call: &FunctionCall) -> ExprResult<Value> {
        match form {
            SpecialForm::If => {
                self.expect_args(call, 3, Some(3))?;
                let (taken, untaken) = if self.evaluate_bool(call, 0)? {
                    (&call.args[1], &call.args[2])
                } else {
                    (&call.args[2], &call.args[1])
                };
                self.scan_untaken(untaken);
                self.evaluate(taken)
            }
            SpecialForm::And => {
                self.expect_args(call, 2, None)?;
                for i in 0..call.args.len() {
                    if !self.evaluate_bool(call, i)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            SpecialForm::Or => {
                self.expect_args(call, 2, None)?;
                for i in 0..call.args.len() {
                    if self.evaluate_bool(call, i)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            SpecialForm::Lambda => Err(ExpressionError::invalid_argument(
                "lambda",
                "a lambda can only be passed to map, filter, reduce or sort",
            )),
            SpecialForm::LambdaVariables => {
                self.expect_args(call, 1, Some(1))?;
                let name = match self.evaluate(&call.args[0])? {
                    Value::String(s) => s,
                    other => {
                        return Err(ExpressionError::type_mismatch(
                            "argument 1 of 'lambdaVariables'",
                            "string",
                            &other,
                        ))
                    }
                };
                self.lambda_variable(&name)
            }
            SpecialForm::Map => {
                self.expect_args(call, 2, Some(2))?;
                let items = self.evaluate_array(call, 0)?;
                let lambda = lambda_arg(call, 1)?;
                let mapped = items
                    .into_iter()
                    .map(|item| self.apply_lambda(lambda, vec![item]))
                    .collect::<ExprResult<Vec<_>>>()?;
                Ok(Value::Array(mapped))
            }
            SpecialForm::Filter => {
                self.expect_args(call, 2, Some(2))?;
                let items = self.evaluate_array(call, 0)?;
                let lambda = lambda_arg(call, 1)?;
                let mut kept = Vec::new();
                for item in items {
                    match self.apply_lambda(lambda, vec![item.clone()])? {
                        Value::Bool(true) => kept.push(item),
                        Value::Bool(false) => {}
                        other => {
                            return Err(ExpressionError::type_mismatch(
                                "result of 'filter' lambda",
                                "bool",
                                &other,
                            ))
                        }
                    }
                }
                Ok(Value::Array(kept))
            }
            SpecialForm::Reduce => {
                self.expect_args(call, 3, Some(3))?;
                let items = self.evaluate_array(call, 0)?;
                let mut acc = self.evaluate(&call.args[1])?;
                let lambda = lambda_arg(call, 2)?;
                for item in items {
                    acc = self.apply_lambda(lambda, vec![acc, item])?;
                }
                Ok(acc)
            }
            SpecialForm::Sort => {
                self.expect_args(call, 2, Some(2))?;
                let mut items = self.evaluate_array(call, 0)?;
                let lambda = lambda_arg(call, 1)?;
                let mut failure = None;
                items.sort_by(|a, b| {
                    if failure.is_some() {
                        return Ordering::Equal;
                    }
                    let result = self.lambda_less(lambda, a, b).and_then(|lt| {
                        if lt {
                            Ok(Ordering::Less)
                        } else if self.lambda_less(lambda, b, a)? {
                            Ok(Ordering::Greater)
                        } else {
                            Ok(Ordering::Equal)
                        }
                    });
                    result.unwrap_or_else(|e| {
                        failure = Some(e);
                        Ordering::Equal
                    })
                });
                match failure {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(items)),
                }
            }
        }
    }

    fn evaluate_array(&mut self, call: &FunctionCall, index: usize) -> ExprResult<Vec<Value>> {
        match self.evaluate(&call.args[index])? {
            Value::Array(a) => Ok(a),
            other => Err(ExpressionError::type_mismatch(
                format!("argument {} of '{}'", index + 1, call.name),
                "array",
                &other,
            )),
        }
    }

    fn lambda_less(&mut self, lambda: &FunctionCall, a: &Value, b: &Value) -> ExprResult<bool> {
        match self.apply_lambda(lambda, vec![a.clone(), b.clone()])? {
            Value::Bool(lt) => Ok(lt),
            other => Err(ExpressionError::type_mismatch(
                "result of 'sort' lambda",
                "bool",
                &other,
            )),
        }
    }

    /// Bind `values` to the lambda's parameter names and evaluate its body
    fn apply_lambda(&mut self, lambda: &FunctionCall, values: Vec<Value>) -> ExprResult<Value> {
        let Some((body, params)) = lambda.args.split_last() else {
            return Err(ExpressionError::invalid_argument("lambda", "missing body"));
        };
        if params.len() != values.len() {
            return Err(ExpressionError::invalid_argument(
                "lambda",
                format!("expects {} parameter(s), got {}", values.len(), params.len()),
            ));
        }

        let mut scope = Vec::with_capacity(params.len());
        for (param, value) in params.iter().zip(values) {
            match param {
                Expr::String(name) => scope.push((name.clone(), value)),
                _ => {
                    return Err(ExpressionError::invalid_argument(
                        "lambda",
                        "parameter names must be string literals",
                    ))
                }
            }
        }

        self.lambda_scopes.push(scope);
        let result = self.evaluate(body);
        self.lambda_scopes.pop();
        result
    }

    fn lambda_variable(&self, name: &str) -> ExprResult<Value> {
        self.lambda_scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter())
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ExpressionError::UnknownLambdaVariable {
                name: name.to_string(),
            })
    }

    /// Report unknown functions in a branch that will not run
    fn scan_untaken(&mut self, expr: &Expr) {
        let mut unknown = Vec::new();
        expr.visit_calls(&mut |call| {
            if call.namespace.is_none() && !functions::is_known_function(&call.name) {
                unknown.push((call.name.clone(), call.span.start));
            }
        });
        for (name, position) in unknown {
            self.host.warn(format!(
                "Unknown function '{}' at offset {} in an if() branch that was not taken",
                name, position
            ));
        }
    }
}

fn lambda_arg(call: &FunctionCall, index: usize) -> ExprResult<&FunctionCall> {
    call.args[index]
        .as_call()
        .filter(|c| c.is_named("lambda"))
        .ok_or_else(|| {
            ExpressionError::invalid_argument(
                &call.name,
                format!("argument {} must be a lambda", index + 1),
            )
        })
}

fn property(target: &Value, name: &str) -> ExprResult<Value> {
    if let Some(member) = mock_member(target, name) {
        return Ok(member);
    }
    match target {
        Value::Object(map) => get_property(map, name)
            .cloned()
            .ok_or_else(|| ExpressionError::MissingProperty {
                property: name.to_string(),
            }),
        other => Err(ExpressionError::TypeMismatch {
            context: format!("property access '.{}'", name),
            expected: "object".into(),
            found: type_name(other).into(),
        }),
    }
}

fn element(target: &Value, index: &Value) -> ExprResult<Value> {
    if target.is_string() {
        if let Some(member) = mock_member(target, &to_display_string(index)) {
            return Ok(member);
        }
    }
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n.as_i64().ok_or_else(|| ExpressionError::overflow("array index"))?;
            usize::try_from(i)
                .ok()
                .and_then(|u| items.get(u))
                .cloned()
                .ok_or(ExpressionError::IndexOutOfRange {
                    index: i,
                    len: items.len(),
                })
        }
        (Value::Object(_), Value::String(name)) => property(target, name),
        (target, index) => Err(ExpressionError::TypeMismatch {
            context: "index access".into(),
            expected: "array[int] or object['name']".into(),
            found: format!("{}[{}]", type_name(target), type_name(index)),
        }),
    }
}

/// Evaluate one JSON string value against `host`
pub fn evaluate_template_string(host: &mut dyn ExpressionHost, input: &str) -> ExprResult<Value> {
    Evaluator::new(host).evaluate_str(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn eval(host: &mut StaticHost, input: &str) -> ExprResult<Value> {
        evaluate_template_string(host, input)
    }

    #[test]
    fn test_literal_passthrough() {
        let mut host = StaticHost::new();
        assert_eq!(eval(&mut host, "hello").unwrap(), json!("hello"));
        assert_eq!(eval(&mut host, "[[not]").unwrap(), json!("[not]"));
    }

    #[test]
    fn test_parameters_and_accessors() {
        let mut host = StaticHost::new().with_parameter("config", json!({"tiers": ["a", "b"]}));
        assert_eq!(
            eval(&mut host, "[parameters('config').tiers[1]]").unwrap(),
            json!("b")
        );
        assert_eq!(
            eval(&mut host, "[parameters('CONFIG')['Tiers'][0]]").unwrap(),
            json!("a")
        );
    }

    #[test]
    fn test_unknown_function_reports_position() {
        let mut host = StaticHost::new();
        let err = eval(&mut host, "[concat('a', nope())]").unwrap_err();
        assert_eq!(
            err,
            ExpressionError::UnknownFunction {
                name: "nope".into(),
                position: 13,
            }
        );
    }

    #[test]
    fn test_function_names_case_insensitive() {
        let mut host = StaticHost::new();
        assert_eq!(eval(&mut host, "[ToUpper('abc')]").unwrap(), json!("ABC"));
    }

    #[test]
    fn test_if_short_circuits_and_warns() {
        let mut host = StaticHost::new();
        let v = eval(&mut host, "[if(true, 'yes', secretsOf('x'))]").unwrap();
        assert_eq!(v, json!("yes"));
        assert_eq!(host.warnings.len(), 1);
        assert!(host.warnings[0].contains("secretsOf"));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let mut host = StaticHost::new();
        assert_eq!(eval(&mut host, "[or(true, parameters('missing'))]").unwrap(), json!(true));
        assert_eq!(eval(&mut host, "[and(false, parameters('missing'))]").unwrap(), json!(false));
        assert!(eval(&mut host, "[and(true, parameters('missing'))]").is_err());
    }

    #[test]
    fn test_integer_literal_overflow() {
        let mut host = StaticHost::new();
        let err = eval(&mut host, "[add(99999999999999999999, 1)]").unwrap_err();
        assert!(matches!(err, ExpressionError::NumericOverflow { .. }));
    }

    #[test]
    fn test_missing_property_and_index() {
        let mut host = StaticHost::new().with_variable("v", json!({"a": [1]}));
        assert!(matches!(
            eval(&mut host, "[variables('v').b]"),
            Err(ExpressionError::MissingProperty { .. })
        ));
        assert_eq!(
            eval(&mut host, "[variables('v').a[3]]").unwrap_err(),
            ExpressionError::IndexOutOfRange { index: 3, len: 1 }
        );
    }

    #[test]
    fn test_placeholder_accepts_any_member() {
        let mut host = StaticHost::new();
        assert_eq!(
            eval(&mut host, "[listKeys('sa', '2023-01-01').keys[0].value]").unwrap(),
            json!("{{SecretList.keys.0.value}}")
        );
        assert_eq!(
            eval(&mut host, "[listKeys('sa', '2023-01-01')['keys']]").unwrap(),
            json!("{{SecretList.keys}}")
        );
        assert!(matches!(
            eval(&mut host, "[listKeys('sa')]"),
            Err(ExpressionError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_map_filter_reduce_sort() {
        let mut host = StaticHost::new().with_parameter("xs", json!([3, 1, 2]));
        assert_eq!(
            eval(&mut host, "[map(parameters('xs'), lambda('x', mul(lambdaVariables('x'), 2)))]")
                .unwrap(),
            json!([6, 2, 4])
        );
        assert_eq!(
            eval(&mut host, "[filter(parameters('xs'), lambda('x', greater(lambdaVariables('x'), 1)))]")
                .unwrap(),
            json!([3, 2])
        );
        assert_eq!(
            eval(
                &mut host,
                "[reduce(parameters('xs'), 0, lambda('cur', 'next', add(lambdaVariables('cur'), lambdaVariables('next'))))]"
            )
            .unwrap(),
            json!(6)
        );
        assert_eq!(
            eval(
                &mut host,
                "[sort(parameters('xs'), lambda('a', 'b', less(lambdaVariables('a'), lambdaVariables('b'))))]"
            )
            .unwrap(),
            json!([1, 2, 3])
        );
    }

    #[test]
    fn test_lambda_outside_higher_order_function() {
        let mut host = StaticHost::new();
        assert!(eval(&mut host, "[lambda('x', 1)]").is_err());
    }
}
