//! Deployment scope
//!
//! Per-deployment evaluation state and the [`ExpressionHost`] the evaluator
//! talks to: parameters (caller values, lazily evaluated defaults), variables
//! (lazily evaluated and cached), the copy loop stack, the symbol table and
//! the resources expanded so far.
//!
//! Name lookups never reach a parent deployment. Nested deployments get a
//! scope of their own.

use std::collections::HashMap;
use std::sync::Arc;

use arm_expr::ids::{self, ScopeLevel};
use arm_expr::value::{
    get_property, mock, to_display_string, type_name, values_equal, MOCK_RESOURCE,
};
use arm_expr::{
    evaluate_template_string, is_expression, Evaluator, ExprResult, ExpressionError,
    ExpressionHost,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::ExpansionOptions;
use crate::diagnostics::{
    external_reference_warning, Diagnostic, DiagnosticCode, DiagnosticSink, TemplateLocation,
};
use crate::error::{ExpandError, Result};
use crate::resource::{ResourceIdentity, ResourceValue};
use crate::symbols::{split_indexed, SymbolTable};
use crate::template::{ParameterDefinition, Template, UserFunction};

// ============================================================================
// Identity
// ============================================================================

/// Where a deployment runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentIdentity {
    pub name: String,
    pub subscription_id: String,
    pub subscription_display_name: String,
    pub tenant_id: String,
    pub resource_group: String,
    pub location: String,
    pub management_group: String,
    pub scope_level: ScopeLevel,
    /// Deployment that declared this one; never used for name lookup
    pub parent: Option<String>,
}

impl DeploymentIdentity {
    pub fn root(options: &ExpansionOptions, scope_level: ScopeLevel) -> Self {
        Self {
            name: options.deployment_name.clone(),
            subscription_id: options.subscription.subscription_id.clone(),
            subscription_display_name: options.subscription.display_name.clone(),
            tenant_id: options.tenant_id.clone(),
            resource_group: options.resource_group.name.clone(),
            location: options.resource_group.location.clone(),
            management_group: options.management_group.clone(),
            scope_level,
            parent: None,
        }
    }

    /// Id of the scope resources are deployed into
    pub fn scope_id(&self) -> String {
        match self.scope_level {
            ScopeLevel::ResourceGroup => {
                ids::resource_group_scope(&self.subscription_id, &self.resource_group)
            }
            ScopeLevel::Subscription => ids::subscription_scope(&self.subscription_id),
            ScopeLevel::ManagementGroup => ids::management_group_scope(&self.management_group),
            ScopeLevel::Tenant => "/".to_string(),
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone)]
enum Slot {
    InProgress,
    Evaluated(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeclarationState {
    Pending,
    Expanded,
    Skipped,
    Failed,
}

/// An id computed ahead of expansion so references by id can wait for it
#[derive(Debug, Clone)]
pub(crate) struct KnownIdentity {
    pub declaration: usize,
    pub id: String,
    pub name: String,
}

/// Outcome of resolving a `reference()` target
enum Lookup {
    Found(Value),
    Pending,
    Failed,
    Skipped,
    /// Declared, finished, and still not bound (e.g. a zero-count loop)
    Missing,
    External,
}

pub struct DeploymentScope {
    pub(crate) template: Arc<Template>,
    pub(crate) options: Arc<ExpansionOptions>,
    sink: Arc<dyn DiagnosticSink>,
    pub(crate) identity: DeploymentIdentity,
    caller_parameters: HashMap<String, Value>,
    parameters: HashMap<String, Slot>,
    variables: HashMap<String, Slot>,
    copy_stack: Vec<(String, i64)>,
    pub(crate) symbols: SymbolTable,
    /// Emitted by this deployment, in expansion order
    pub(crate) resources: Vec<ResourceValue>,
    /// `existing` declarations: bound but not emitted
    pub(crate) existing: Vec<ResourceValue>,
    pub(crate) states: Vec<DeclarationState>,
    pub(crate) known: Vec<KnownIdentity>,
    /// Ids of instances whose condition was false
    pub(crate) skipped: Vec<String>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    secure_values: Vec<Value>,
    guid_counter: u64,
    pointer: String,
}

impl DeploymentScope {
    pub fn new(
        template: Arc<Template>,
        options: Arc<ExpansionOptions>,
        sink: Arc<dyn DiagnosticSink>,
        identity: DeploymentIdentity,
        caller_parameters: Map<String, Value>,
    ) -> Result<Self> {
        let mut scope = Self {
            states: vec![DeclarationState::Pending; template.resources.len()],
            template,
            options,
            sink,
            identity,
            caller_parameters: HashMap::new(),
            parameters: HashMap::new(),
            variables: HashMap::new(),
            copy_stack: Vec::new(),
            symbols: SymbolTable::new(),
            resources: Vec::new(),
            existing: Vec::new(),
            known: Vec::new(),
            skipped: Vec::new(),
            diagnostics: Vec::new(),
            secure_values: Vec::new(),
            guid_counter: 0,
            pointer: String::new(),
        };

        let template = Arc::clone(&scope.template);
        for (name, value) in caller_parameters {
            let pointer = format!("/parameters/{}", name);
            match template.parameter(&name) {
                Some(definition) => {
                    check_parameter(definition, &value)
                        .map_err(|e| ExpandError::expression(&pointer, e))?;
                    scope.caller_parameters.insert(name.to_ascii_lowercase(), value);
                }
                None => scope.report_at(
                    &pointer,
                    Diagnostic::warning(
                        DiagnosticCode::UnknownParameterValue,
                        format!("Parameter '{}' is not declared by the template", name),
                    ),
                ),
            }
        }
        Ok(scope)
    }

    pub fn identity(&self) -> &DeploymentIdentity {
        &self.identity
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    pub(crate) fn report_at(&mut self, pointer: &str, diagnostic: Diagnostic) {
        let diagnostic = match diagnostic.location {
            Some(_) => diagnostic,
            None => diagnostic.with_location(TemplateLocation::new(&self.identity.name, pointer)),
        };
        if self.diagnostics.contains(&diagnostic) {
            return;
        }
        self.sink.report(&diagnostic);
        self.diagnostics.push(diagnostic);
    }

    pub(crate) fn report(&mut self, diagnostic: Diagnostic) {
        let pointer = self.pointer.clone();
        self.report_at(&pointer, diagnostic);
    }

    // ------------------------------------------------------------------------
    // JSON evaluation
    // ------------------------------------------------------------------------

    /// Evaluate every expression inside `value`.
    ///
    /// Object keys may be expressions. A `copy` array of `{name, count,
    /// input}` entries inside an object becomes one array property per entry.
    pub fn evaluate_json(&mut self, value: &Value, pointer: &str) -> Result<Value> {
        match value {
            Value::String(s) => self.evaluate_string(s, pointer),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| self.evaluate_json(item, &format!("{}/{}", pointer, i)))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(object) => {
                let mut out = Map::new();
                for (key, item) in object {
                    let item_pointer = format!("{}/{}", pointer, key);
                    if key.eq_ignore_ascii_case("copy") && is_property_copy(item) {
                        for entry in item.as_array().into_iter().flatten() {
                            if let Value::Object(entry) = entry {
                                let (name, values) = self.expand_copy_entry(entry, &item_pointer)?;
                                out.insert(name, values);
                            }
                        }
                        continue;
                    }
                    let key = if key.starts_with('[') {
                        to_display_string(&self.evaluate_string(key, &item_pointer)?)
                    } else {
                        key.clone()
                    };
                    out.insert(key, self.evaluate_json(item, &item_pointer)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    pub fn evaluate_string(&mut self, input: &str, pointer: &str) -> Result<Value> {
        if !input.starts_with('[') {
            return Ok(Value::String(input.to_string()));
        }
        let previous = std::mem::replace(&mut self.pointer, pointer.to_string());
        let result = Evaluator::new(self).evaluate_str(input);
        self.pointer = previous;
        result.map_err(|e| ExpandError::expression(pointer, e))
    }

    /// Evaluate a copy `count` and check it against the configured limit
    pub fn evaluate_count(&mut self, count: &Value, pointer: &str) -> Result<usize> {
        let value = self.evaluate_json(count, pointer)?;
        let count = value.as_i64().ok_or_else(|| {
            ExpandError::expression(pointer, ExpressionError::type_mismatch("copy count", "int", &value))
        })?;
        let max = self.options.max_copy_count;
        usize::try_from(count)
            .ok()
            .filter(|c| *c <= max)
            .ok_or_else(|| {
                ExpandError::expression(
                    pointer,
                    ExpressionError::invalid_argument(
                        "copy",
                        format!("count {} is outside 0..={}", count, max),
                    ),
                )
            })
    }

    /// Run `f` with `loop_name` set to `index` for `copyIndex()`
    pub fn with_copy_frame<T>(
        &mut self,
        loop_name: &str,
        index: usize,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        self.push_copy_frame(loop_name, index);
        let result = f(self);
        self.pop_copy_frame();
        result
    }

    pub(crate) fn push_copy_frame(&mut self, loop_name: &str, index: usize) {
        self.copy_stack.push((loop_name.to_string(), index as i64));
    }

    pub(crate) fn pop_copy_frame(&mut self) {
        self.copy_stack.pop();
    }

    fn with_empty_copy_stack<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let saved = std::mem::take(&mut self.copy_stack);
        let result = f(self);
        self.copy_stack = saved;
        result
    }

    /// `{name, count, input}` → (`name`, array of `input` per index)
    fn expand_copy_entry(&mut self, entry: &Map<String, Value>, pointer: &str) -> Result<(String, Value)> {
        let name = get_property(entry, "name")
            .and_then(Value::as_str)
            .ok_or_else(|| ExpandError::malformed(pointer, "copy entry is missing 'name'"))?
            .to_string();
        let count = get_property(entry, "count")
            .ok_or_else(|| ExpandError::malformed(pointer, "copy entry is missing 'count'"))?;
        let input = get_property(entry, "input")
            .ok_or_else(|| ExpandError::malformed(pointer, "copy entry is missing 'input'"))?;

        let count = self.evaluate_count(count, &format!("{}/count", pointer))?;
        let input_pointer = format!("{}/input", pointer);
        let mut values = Vec::with_capacity(count);
        for index in 0..count {
            let value = self.with_copy_frame(&name, index, |scope| {
                scope.evaluate_json(input, &input_pointer)
            })?;
            values.push(value);
        }
        Ok((name, Value::Array(values)))
    }

    // ------------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------------

    /// Compute where a resource lives.
    ///
    /// `scope` makes it an extension resource; a relative scope is taken
    /// from this deployment. `resource_group`/`subscription_id` overrides
    /// apply to nested deployment resources.
    pub fn resource_identity(
        &self,
        resource_type: &str,
        name: &str,
        scope: Option<&str>,
        resource_group: Option<&str>,
        subscription_id: Option<&str>,
    ) -> ExprResult<ResourceIdentity> {
        let scope_id = match scope {
            Some(s) if s.starts_with('/') => s.to_string(),
            Some(s) => format!(
                "{}/providers/{}",
                self.identity.scope_id().trim_end_matches('/'),
                s
            ),
            None => {
                let subscription = subscription_id.unwrap_or(&self.identity.subscription_id);
                match (self.identity.scope_level, resource_group, subscription_id) {
                    (_, Some(rg), _) => ids::resource_group_scope(subscription, rg),
                    (ScopeLevel::ResourceGroup, None, _) => {
                        ids::resource_group_scope(subscription, &self.identity.resource_group)
                    }
                    (ScopeLevel::Subscription, None, _) | (_, None, Some(_)) => {
                        ids::subscription_scope(subscription)
                    }
                    (ScopeLevel::ManagementGroup, None, None) => {
                        ids::management_group_scope(&self.identity.management_group)
                    }
                    (ScopeLevel::Tenant, None, None) => "/".to_string(),
                }
            }
        };

        let id = ids::scoped_resource_id(&scope_id, resource_type, &ids::split_name(name))
            .map_err(|e| e.into_expression_error("resourceId"))?;
        Ok(ResourceIdentity {
            id,
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            scope: scope_id,
        })
    }

    // ------------------------------------------------------------------------
    // Secrets
    // ------------------------------------------------------------------------

    pub(crate) fn secure_values(&self) -> &[Value] {
        &self.secure_values
    }

    fn remember_secure(&mut self, value: &Value) {
        let worth_tracking = match value {
            Value::String(s) => !s.is_empty(),
            Value::Object(o) => !o.is_empty(),
            _ => false,
        };
        if worth_tracking && !self.secure_values.contains(value) {
            self.secure_values.push(value.clone());
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    fn all_resources(&self) -> impl Iterator<Item = &ResourceValue> {
        self.resources.iter().chain(self.existing.iter())
    }

    fn state_lookup(state: DeclarationState) -> Lookup {
        match state {
            DeclarationState::Pending => Lookup::Pending,
            DeclarationState::Failed => Lookup::Failed,
            DeclarationState::Skipped => Lookup::Skipped,
            DeclarationState::Expanded => Lookup::Missing,
        }
    }

    fn symbol_state(&self, symbol: &str) -> Lookup {
        let states: Vec<DeclarationState> = self
            .template
            .resources
            .iter()
            .filter(|d| d.symbol().is_some_and(|s| s.eq_ignore_ascii_case(symbol)))
            .map(|d| self.states[d.ordinal])
            .collect();
        if states.contains(&DeclarationState::Failed) {
            Lookup::Failed
        } else if states.contains(&DeclarationState::Pending) {
            Lookup::Pending
        } else if !states.is_empty() && states.iter().all(|s| *s == DeclarationState::Skipped) {
            Lookup::Skipped
        } else {
            Lookup::Missing
        }
    }

    fn by_id(&self, id: &str, project: &dyn Fn(&ResourceValue) -> Value) -> Lookup {
        if self.skipped.iter().any(|s| ids::ids_equal(s, id)) {
            return Lookup::Skipped;
        }
        match self.all_resources().find(|r| ids::ids_equal(&r.id, id)) {
            Some(resource) => Lookup::Found(project(resource)),
            None => Lookup::Pending,
        }
    }

    /// Resolve a symbolic name, `name[i]`, resource id or resource name
    fn lookup(&self, target: &str, project: &dyn Fn(&ResourceValue) -> Value) -> ExprResult<Lookup> {
        let symbol = split_indexed(target).map(|(name, _)| name).unwrap_or(target);
        if self.symbols.contains(symbol) {
            let bound = self
                .symbols
                .lookup(target)
                .map_err(|e| ExpressionError::invalid_argument("reference", e.to_string()))?;
            return Ok(match bound {
                Some(id) => self.by_id(&id, project),
                None => self.symbol_state(symbol),
            });
        }

        if let Some(resource) = self
            .all_resources()
            .find(|r| ids::ids_equal(&r.id, target) || r.name.eq_ignore_ascii_case(target))
        {
            return Ok(Lookup::Found(project(resource)));
        }
        if self.skipped.iter().any(|s| ids::ids_equal(s, target)) {
            return Ok(Lookup::Skipped);
        }
        if let Some(known) = self
            .known
            .iter()
            .find(|k| ids::ids_equal(&k.id, target) || k.name.eq_ignore_ascii_case(target))
        {
            return Ok(Self::state_lookup(self.states[known.declaration]));
        }
        Ok(Lookup::External)
    }

    fn resolve(&mut self, target: &str, project: &dyn Fn(&ResourceValue) -> Value) -> ExprResult<Value> {
        match self.lookup(target, project)? {
            Lookup::Found(value) => Ok(value),
            Lookup::Pending => Err(ExpressionError::UnresolvedSymbol {
                symbol: target.to_string(),
            }),
            Lookup::Failed => Err(ExpressionError::DependencyFailed {
                symbol: target.to_string(),
            }),
            Lookup::Skipped => Err(ExpressionError::ConditionFalse {
                symbol: target.to_string(),
            }),
            Lookup::Missing => Err(ExpressionError::invalid_argument(
                "reference",
                format!("'{}' is not bound to a resource", target),
            )),
            Lookup::External => {
                self.report(external_reference_warning(target));
                Ok(mock(MOCK_RESOURCE))
            }
        }
    }
}

/// Validate a parameter value against its declaration
fn check_parameter(definition: &ParameterDefinition, value: &Value) -> ExprResult<()> {
    if value.is_null() && definition.nullable {
        return Ok(());
    }
    if !definition.parameter_type.accepts(value) {
        return Err(ExpressionError::TypeMismatch {
            context: format!("parameter '{}'", definition.name),
            expected: definition.parameter_type.as_str().to_string(),
            found: type_name(value).to_string(),
        });
    }
    if let Some(allowed) = &definition.allowed_values {
        let is_allowed = |v: &Value| allowed.iter().any(|a| values_equal(a, v));
        let ok = match value {
            Value::Array(items) if !allowed.iter().any(Value::is_array) => items.iter().all(is_allowed),
            other => is_allowed(other),
        };
        if !ok {
            return Err(ExpressionError::invalid_argument(
                "parameters",
                format!(
                    "value {} for '{}' is not one of the allowed values",
                    value, definition.name
                ),
            ));
        }
    }
    Ok(())
}

fn is_property_copy(value: &Value) -> bool {
    value.as_array().is_some_and(|entries| {
        !entries.is_empty()
            && entries.iter().all(|e| {
                e.as_object().is_some_and(|o| {
                    get_property(o, "name").is_some() && get_property(o, "input").is_some()
                })
            })
    })
}

/// Back to the evaluator's error type at the host seam
fn into_expression_error(error: ExpandError) -> ExpressionError {
    match error {
        ExpandError::Expression { source, .. } => source,
        other => ExpressionError::Malformed {
            message: other.to_string(),
        },
    }
}

/// Evaluate every string inside `value` against an arbitrary host
pub fn evaluate_value(host: &mut dyn ExpressionHost, value: &Value) -> ExprResult<Value> {
    match value {
        Value::String(s) => evaluate_template_string(host, s),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_value(host, item))
            .collect::<ExprResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(object) => {
            let mut out = Map::new();
            for (key, item) in object {
                let key = if is_expression(key) {
                    to_display_string(&evaluate_template_string(host, key)?)
                } else {
                    key.clone()
                };
                out.insert(key, evaluate_value(host, item)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

// ============================================================================
// ExpressionHost
// ============================================================================

enum RawVariable {
    Plain(Value),
    Copy(Map<String, Value>),
}

impl ExpressionHost for DeploymentScope {
    fn parameter(&mut self, name: &str) -> ExprResult<Value> {
        let key = name.to_ascii_lowercase();
        match self.parameters.get(&key) {
            Some(Slot::Evaluated(value)) => return Ok(value.clone()),
            Some(Slot::InProgress) => {
                return Err(ExpressionError::CyclicVariableReference {
                    name: name.to_string(),
                })
            }
            None => {}
        }

        let template = Arc::clone(&self.template);
        let definition = template
            .parameter(name)
            .ok_or_else(|| ExpressionError::UnknownParameter {
                name: name.to_string(),
            })?;

        let value = if let Some(value) = self.caller_parameters.get(&key) {
            value.clone()
        } else if let Some(default) = &definition.default_value {
            self.parameters.insert(key.clone(), Slot::InProgress);
            let pointer = format!("/parameters/{}/defaultValue", definition.name);
            let result = self
                .with_empty_copy_stack(|scope| scope.evaluate_json(default, &pointer))
                .map_err(into_expression_error)
                .and_then(|v| check_parameter(definition, &v).map(|_| v));
            match result {
                Ok(value) => value,
                Err(e) => {
                    self.parameters.remove(&key);
                    return Err(e);
                }
            }
        } else if definition.nullable {
            Value::Null
        } else {
            return Err(ExpressionError::MissingRequiredParameter {
                name: definition.name.clone(),
            });
        };

        if definition.parameter_type.is_secure() {
            self.remember_secure(&value);
        }
        self.parameters.insert(key, Slot::Evaluated(value.clone()));
        Ok(value)
    }

    fn variable(&mut self, name: &str) -> ExprResult<Value> {
        let key = name.to_ascii_lowercase();
        match self.variables.get(&key) {
            Some(Slot::Evaluated(value)) => return Ok(value.clone()),
            Some(Slot::InProgress) => {
                return Err(ExpressionError::CyclicVariableReference {
                    name: name.to_string(),
                })
            }
            None => {}
        }

        let unknown = || ExpressionError::UnknownVariable {
            name: name.to_string(),
        };
        let raw = if key == "copy" {
            None
        } else {
            get_property(&self.template.variables, name)
                .cloned()
                .map(RawVariable::Plain)
                .or_else(|| {
                    get_property(&self.template.variables, "copy")
                        .and_then(Value::as_array)
                        .and_then(|entries| {
                            entries.iter().filter_map(Value::as_object).find(|e| {
                                get_property(e, "name")
                                    .and_then(Value::as_str)
                                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
                            })
                        })
                        .cloned()
                        .map(RawVariable::Copy)
                })
        };
        let raw = raw.ok_or_else(unknown)?;

        self.variables.insert(key.clone(), Slot::InProgress);
        let pointer = format!("/variables/{}", name);
        let result = self.with_empty_copy_stack(|scope| match &raw {
            RawVariable::Plain(value) => scope.evaluate_json(value, &pointer),
            RawVariable::Copy(entry) => scope
                .expand_copy_entry(entry, "/variables/copy")
                .map(|(_, values)| values),
        });
        match result {
            Ok(value) => {
                self.variables.insert(key, Slot::Evaluated(value.clone()));
                Ok(value)
            }
            Err(e) => {
                self.variables.remove(&key);
                Err(into_expression_error(e))
            }
        }
    }

    fn copy_index(&self, loop_name: Option<&str>) -> ExprResult<i64> {
        let found = match loop_name {
            None => self.copy_stack.last(),
            Some(name) => self
                .copy_stack
                .iter()
                .rev()
                .find(|(n, _)| n.eq_ignore_ascii_case(name)),
        };
        found
            .map(|(_, index)| *index)
            .ok_or_else(|| ExpressionError::CopyIndexUnavailable {
                loop_name: loop_name.map(str::to_string),
            })
    }

    fn reference(&mut self, target: &str, full: bool) -> ExprResult<Value> {
        if full {
            self.resolve(target, &|r: &ResourceValue| r.to_json())
        } else {
            self.resolve(target, &|r: &ResourceValue| r.properties())
        }
    }

    fn resource_info(&mut self, symbol: &str) -> ExprResult<Value> {
        self.resolve(symbol, &|r: &ResourceValue| r.info())
    }

    fn user_function(&mut self, namespace: &str, name: &str, args: Vec<Value>) -> ExprResult<Value> {
        let qualified = format!("{}.{}", namespace, name);
        let template = Arc::clone(&self.template);
        let function = template
            .user_function(namespace, name)
            .ok_or_else(|| ExpressionError::UnknownFunction {
                name: qualified.clone(),
                position: 0,
            })?;

        if args.len() != function.parameters.len() {
            return Err(ExpressionError::ArgumentCount {
                function: qualified,
                expected: function.parameters.len().to_string(),
                actual: args.len(),
            });
        }

        let mut parameters = HashMap::new();
        for ((param, param_type), value) in function.parameters.iter().zip(args) {
            if !param_type.accepts(&value) {
                return Err(ExpressionError::TypeMismatch {
                    context: format!("parameter '{}' of {}", param, qualified),
                    expected: param_type.as_str().to_string(),
                    found: type_name(&value).to_string(),
                });
            }
            parameters.insert(param.to_ascii_lowercase(), value);
        }

        let mut host = FunctionHost {
            outer: self,
            function,
            parameters,
        };
        let value = evaluate_value(&mut host, &function.output_value)?;
        if !function.output_type.accepts(&value) {
            return Err(ExpressionError::TypeMismatch {
                context: format!("output of {}", qualified),
                expected: function.output_type.as_str().to_string(),
                found: type_name(&value).to_string(),
            });
        }
        Ok(value)
    }

    fn deployment(&self) -> Value {
        let mut template = match &self.template.raw {
            Value::Object(raw) => raw.clone(),
            _ => Map::new(),
        };
        if get_property(&template, "contentVersion").is_none() {
            template.insert("contentVersion".to_string(), json!("1.0.0.0"));
        }
        let mut deployment = json!({
            "name": self.identity.name,
            "properties": {
                "template": template,
                "parameters": {},
                "mode": "Incremental",
                "provisioningState": "Accepted"
            }
        });
        if self.identity.scope_level != ScopeLevel::ResourceGroup {
            deployment["location"] = Value::String(self.identity.location.clone());
        }
        deployment
    }

    fn subscription(&self) -> Value {
        json!({
            "id": ids::subscription_scope(&self.identity.subscription_id),
            "subscriptionId": self.identity.subscription_id,
            "tenantId": self.identity.tenant_id,
            "displayName": self.identity.subscription_display_name
        })
    }

    fn resource_group(&self) -> Value {
        let mut group = json!({
            "id": ids::resource_group_scope(&self.identity.subscription_id, &self.identity.resource_group),
            "name": self.identity.resource_group,
            "type": ids::RESOURCE_GROUP_TYPE,
            "location": self.identity.location,
            "tags": Value::Object(self.options.resource_group.tags.clone()),
            "properties": { "provisioningState": "Succeeded" }
        });
        if let Some(managed_by) = &self.options.resource_group.managed_by {
            group["managedBy"] = Value::String(managed_by.clone());
        }
        group
    }

    fn tenant(&self) -> Value {
        json!({
            "id": format!("/tenants/{}", self.identity.tenant_id),
            "tenantId": self.identity.tenant_id
        })
    }

    fn management_group(&self) -> Value {
        json!({
            "id": ids::management_group_scope(&self.identity.management_group),
            "name": self.identity.management_group,
            "type": ids::MANAGEMENT_GROUP_TYPE,
            "properties": { "tenantId": self.identity.tenant_id }
        })
    }

    fn scope_level(&self) -> ScopeLevel {
        self.identity.scope_level
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.options.utc_now
    }

    fn new_guid(&mut self) -> Uuid {
        self.guid_counter += 1;
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("{}/{}", self.identity.name, self.guid_counter).as_bytes(),
        )
    }

    fn warn(&mut self, message: String) {
        self.report(Diagnostic::warning(DiagnosticCode::ExpressionWarning, message));
    }
}

/// Host for a user-defined function body: only its own parameters are visible
struct FunctionHost<'a> {
    outer: &'a mut DeploymentScope,
    function: &'a UserFunction,
    parameters: HashMap<String, Value>,
}

impl FunctionHost<'_> {
    fn unavailable(&self, what: &str) -> ExpressionError {
        ExpressionError::invalid_argument(
            what,
            format!(
                "not available inside user-defined function '{}.{}'",
                self.function.namespace, self.function.name
            ),
        )
    }
}

impl ExpressionHost for FunctionHost<'_> {
    fn parameter(&mut self, name: &str) -> ExprResult<Value> {
        self.parameters
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownParameter {
                name: name.to_string(),
            })
    }

    fn variable(&mut self, _: &str) -> ExprResult<Value> {
        Err(self.unavailable("variables"))
    }

    fn reference(&mut self, _: &str, _: bool) -> ExprResult<Value> {
        Err(self.unavailable("reference"))
    }

    fn resource_info(&mut self, _: &str) -> ExprResult<Value> {
        Err(self.unavailable("resourceInfo"))
    }

    fn user_function(&mut self, namespace: &str, name: &str, args: Vec<Value>) -> ExprResult<Value> {
        self.outer.user_function(namespace, name, args)
    }

    fn deployment(&self) -> Value {
        self.outer.deployment()
    }

    fn subscription(&self) -> Value {
        self.outer.subscription()
    }

    fn resource_group(&self) -> Value {
        self.outer.resource_group()
    }

    fn tenant(&self) -> Value {
        self.outer.tenant()
    }

    fn management_group(&self) -> Value {
        self.outer.management_group()
    }

    fn scope_level(&self) -> ScopeLevel {
        self.outer.scope_level()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.outer.utc_now()
    }

    fn new_guid(&mut self) -> Uuid {
        self.outer.new_guid()
    }

    fn warn(&mut self, message: String) {
        self.outer.warn(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use pretty_assertions::assert_eq;

    fn scope_for(template: Value, parameters: Value) -> Result<DeploymentScope> {
        let template = Template::from_value(&template)?;
        let options = ExpansionOptions::default();
        let identity = DeploymentIdentity::root(&options, template.scope_level);
        DeploymentScope::new(
            Arc::new(template),
            Arc::new(options),
            Arc::new(CollectingSink::new()),
            identity,
            parameters.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn test_parameter_defaults_are_lazy_and_cached() {
        let mut scope = scope_for(
            json!({
                "parameters": {
                    "prefix": { "type": "string", "defaultValue": "app" },
                    "name": { "type": "string", "defaultValue": "[concat(parameters('prefix'), '-web')]" }
                }
            }),
            json!({}),
        )
        .unwrap();
        assert_eq!(scope.parameter("name").unwrap(), json!("app-web"));
        assert_eq!(scope.parameter("NAME").unwrap(), json!("app-web"));
    }

    #[test]
    fn test_caller_value_wins_and_is_validated() {
        let template = json!({
            "parameters": {
                "sku": { "type": "string", "defaultValue": "Standard_LRS", "allowedValues": ["Standard_LRS", "Premium_LRS"] }
            }
        });
        let mut scope = scope_for(template.clone(), json!({ "sku": "Premium_LRS" })).unwrap();
        assert_eq!(scope.parameter("sku").unwrap(), json!("Premium_LRS"));

        assert!(scope_for(template.clone(), json!({ "sku": "Basic" })).is_err());
        let err = scope_for(template, json!({ "sku": 3 })).err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::TypeMismatch);
    }

    #[test]
    fn test_missing_required_parameter() {
        let mut scope = scope_for(
            json!({ "parameters": { "name": { "type": "string" }, "tags": { "type": "object", "nullable": true } } }),
            json!({}),
        )
        .unwrap();
        assert_eq!(
            scope.parameter("name").unwrap_err(),
            ExpressionError::MissingRequiredParameter { name: "name".into() }
        );
        assert_eq!(scope.parameter("tags").unwrap(), Value::Null);
    }

    #[test]
    fn test_variables_cached_and_cycles_detected() {
        let mut scope = scope_for(
            json!({
                "variables": {
                    "a": "[variables('b')]",
                    "b": "[variables('a')]",
                    "c": "[concat('x', 'y')]"
                }
            }),
            json!({}),
        )
        .unwrap();
        assert_eq!(scope.variable("c").unwrap(), json!("xy"));
        assert!(matches!(
            scope.variable("a"),
            Err(ExpressionError::CyclicVariableReference { .. })
        ));
        // a failed evaluation does not poison the slot
        assert!(matches!(
            scope.variable("a"),
            Err(ExpressionError::CyclicVariableReference { .. })
        ));
    }

    #[test]
    fn test_variable_copy() {
        let mut scope = scope_for(
            json!({
                "variables": {
                    "copy": [
                        { "name": "disks", "count": 3, "input": { "lun": "[copyIndex('disks')]" } }
                    ]
                }
            }),
            json!({}),
        )
        .unwrap();
        assert_eq!(
            scope.variable("disks").unwrap(),
            json!([{ "lun": 0 }, { "lun": 1 }, { "lun": 2 }])
        );
    }

    #[test]
    fn test_property_copy_and_key_expressions() {
        let mut scope = scope_for(json!({}), json!({})).unwrap();
        let value = scope
            .evaluate_json(
                &json!({
                    "[concat('k', '1')]": "[[literal]",
                    "copy": [{ "name": "rules", "count": 2, "input": "[concat('r', string(copyIndex('rules')))]" }]
                }),
                "/resources/0/properties",
            )
            .unwrap();
        assert_eq!(value, json!({ "k1": "[literal]", "rules": ["r0", "r1"] }));
    }

    #[test]
    fn test_copy_count_limit() {
        let mut scope = scope_for(json!({}), json!({})).unwrap();
        assert_eq!(scope.evaluate_count(&json!(0), "/c").unwrap(), 0);
        assert!(scope.evaluate_count(&json!(801), "/c").is_err());
        assert!(scope.evaluate_count(&json!(-1), "/c").is_err());
    }

    #[test]
    fn test_user_function() {
        let mut scope = scope_for(
            json!({
                "functions": [{
                    "namespace": "naming",
                    "members": {
                        "storage": {
                            "parameters": [{ "name": "base", "type": "string" }],
                            "output": { "type": "string", "value": "[toLower(concat(parameters('base'), 'sa'))]" }
                        },
                        "leaky": {
                            "parameters": [],
                            "output": { "type": "string", "value": "[variables('x')]" }
                        }
                    }
                }],
                "variables": { "x": "y" }
            }),
            json!({}),
        )
        .unwrap();
        assert_eq!(
            scope.evaluate_string("[naming.storage('App')]", "/x").unwrap(),
            json!("appsa")
        );
        assert!(scope.evaluate_string("[naming.leaky()]", "/x").is_err());
        assert!(scope.evaluate_string("[naming.storage(1)]", "/x").is_err());
    }

    #[test]
    fn test_identity_by_scope_level() {
        let scope = scope_for(json!({}), json!({})).unwrap();
        let identity = scope
            .resource_identity("Microsoft.Network/virtualNetworks/subnets", "vnet/default", None, None, None)
            .unwrap();
        assert_eq!(
            identity.id,
            "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/ps-rule-test-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/default"
        );

        let sub = scope_for(
            json!({ "$schema": "https://schema.management.azure.com/schemas/2018-05-01/subscriptionDeploymentTemplate.json#" }),
            json!({}),
        )
        .unwrap();
        let rg = sub
            .resource_identity("Microsoft.Resources/resourceGroups", "rg-app", None, None, None)
            .unwrap();
        assert_eq!(
            rg.id,
            "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/rg-app"
        );
    }

    #[test]
    fn test_extension_resource_identity() {
        let scope = scope_for(json!({}), json!({})).unwrap();
        let identity = scope
            .resource_identity(
                "Microsoft.Authorization/locks",
                "lock",
                Some("Microsoft.Storage/storageAccounts/sa"),
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            identity.id,
            "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/ps-rule-test-rg/providers/Microsoft.Storage/storageAccounts/sa/providers/Microsoft.Authorization/locks/lock"
        );
    }

    #[test]
    fn test_deployment_exposes_template() {
        let mut scope = scope_for(
            json!({
                "contentVersion": "2.1.0.0",
                "metadata": { "owner": "platform" },
                "resources": []
            }),
            json!({}),
        )
        .unwrap();
        assert_eq!(
            scope
                .evaluate_string("[deployment().properties.template.contentVersion]", "/outputs/o/value")
                .unwrap(),
            json!("2.1.0.0")
        );
        assert_eq!(
            scope
                .evaluate_string("[deployment().properties.template.metadata.owner]", "/outputs/o/value")
                .unwrap(),
            json!("platform")
        );

        let mut unversioned = scope_for(json!({ "resources": [] }), json!({})).unwrap();
        assert_eq!(
            unversioned
                .evaluate_string("[deployment().properties.template.contentVersion]", "/outputs/o/value")
                .unwrap(),
            json!("1.0.0.0")
        );
    }

    #[test]
    fn test_external_reference_warns() {
        let mut scope = scope_for(json!({}), json!({})).unwrap();
        let value = scope
            .evaluate_string(
                "[reference('/subscriptions/x/resourceGroups/y/providers/Microsoft.Web/sites/z')]",
                "/outputs/o/value",
            )
            .unwrap();
        assert_eq!(value, json!("{{Resource}}"));
        assert_eq!(scope.diagnostics.len(), 1);
        assert_eq!(scope.diagnostics[0].code, DiagnosticCode::ExternalReference);
        assert_eq!(
            scope.diagnostics[0].location.as_ref().unwrap().pointer,
            "/outputs/o/value"
        );
    }

    #[test]
    fn test_new_guid_is_deterministic() {
        let mut a = scope_for(json!({}), json!({})).unwrap();
        let mut b = scope_for(json!({}), json!({})).unwrap();
        let first = a.new_guid();
        assert_eq!(first, b.new_guid());
        assert_ne!(first, a.new_guid());
    }
}
