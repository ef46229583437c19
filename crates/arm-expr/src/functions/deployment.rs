//! Deployment functions

use serde_json::Value;

use super::{Args, Dispatch, Registry};
use crate::error::ExprResult;
use crate::host::ExpressionHost;

pub(super) fn register(r: &mut Registry) {
    r.insert("deployment", Dispatch::Eager(deployment));
    r.insert("environment", Dispatch::Eager(environment));
    r.insert("parameters", Dispatch::Eager(parameters));
    r.insert("variables", Dispatch::Eager(variables));
}

fn deployment(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(host.deployment())
}

fn environment(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(host.environment())
}

fn parameters(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    host.parameter(args.string(0)?)
}

fn variables(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    host.variable(args.string(0)?)
}
