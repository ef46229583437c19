//! Deployment context
//!
//! Drives the expansion of one template:
//! 1. declare a symbol per symbolic name or copy loop
//! 2. compute the ids that can be known up front, so references by id or
//!    name wait for their target instead of being treated as external
//! 3. order declarations by `dependsOn` and parent/child nesting
//! 4. expand in passes; a declaration whose expressions hit a resource that
//!    is not bound yet is retried in the next pass
//! 5. evaluate outputs
//!
//! Nested deployments run in a context of their own; their resources are
//! emitted right after the deployment resource that declared them and their
//! outputs land in that resource's `properties.outputs`.

use std::sync::Arc;

use arm_expr::ids::DEPLOYMENT_TYPE;
use arm_expr::value::{get_property, to_display_string, type_name};
use arm_expr::{ExpressionError, ScopeLevel};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::ExpansionOptions;
use crate::dag::{expansion_order, DependencyNode};
use crate::diagnostics::{
    linked_template_warning, unmatched_dependency_warning, Diagnostic, DiagnosticCode,
    DiagnosticSink, TracingSink,
};
use crate::error::{ExpandError, ExpansionFailure, FailureSubject, Result};
use crate::loader::{parameter_value, TemplateLoader};
use crate::policy::PolicyIgnoreIndex;
use crate::resource::{ResourceIdentity, ResourceValue};
use crate::scope::{DeclarationState, DeploymentIdentity, DeploymentScope, KnownIdentity};
use crate::secrets::{redact_secure_values, SecretPropertyRegistry};
use crate::symbols::SymbolTable;
use crate::template::{OutputDefinition, ResourceDeclaration, Template};

/// Fields evaluated ahead of time to learn a resource's id
const IDENTITY_FIELDS: [&str; 5] = ["type", "name", "scope", "resourceGroup", "subscriptionId"];

// ============================================================================
// Expander
// ============================================================================

/// Entry point: options and collaborators shared by every deployment in a tree
#[derive(Clone)]
pub struct Expander {
    options: Arc<ExpansionOptions>,
    secrets: Arc<SecretPropertyRegistry>,
    policy_ignore: Arc<PolicyIgnoreIndex>,
    loader: Option<Arc<dyn TemplateLoader>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl Expander {
    pub fn new(options: ExpansionOptions) -> anyhow::Result<Self> {
        options.validate()?;
        let policy_ignore = PolicyIgnoreIndex::builtin()?.with_configured(&options.policy_ignore);
        Ok(Self {
            options: Arc::new(options),
            secrets: Arc::new(SecretPropertyRegistry::builtin()?),
            policy_ignore: Arc::new(policy_ignore),
            loader: None,
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_secret_registry(mut self, registry: SecretPropertyRegistry) -> Self {
        self.secrets = Arc::new(registry);
        self
    }

    /// Enable linked templates (`templateLink`)
    pub fn with_loader(mut self, loader: Arc<dyn TemplateLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn options(&self) -> &ExpansionOptions {
        &self.options
    }

    pub fn policy_ignore(&self) -> &PolicyIgnoreIndex {
        &self.policy_ignore
    }

    /// Context for the root deployment of `template`
    pub fn context(
        &self,
        template: Template,
        parameters: Map<String, Value>,
    ) -> Result<DeploymentContext> {
        let identity = DeploymentIdentity::root(&self.options, template.scope_level);
        DeploymentContext::new(self.clone(), template, identity, parameters, 0)
    }

    pub fn expand(
        &self,
        template: &Template,
        parameters: Map<String, Value>,
    ) -> Result<ExpandedDeployment> {
        self.context(template.clone(), parameters)?.expand()
    }

    /// Parse and expand; `parameters` is a parameter file document if given
    pub fn expand_str(
        &self,
        template: &str,
        parameters: Option<&str>,
    ) -> anyhow::Result<ExpandedDeployment> {
        let template = Template::parse(template)?;
        let parameters = match parameters {
            Some(text) => crate::loader::parse_parameter_file(text)?,
            None => Map::new(),
        };
        Ok(self.context(template, parameters)?.expand()?)
    }
}

// ============================================================================
// Result
// ============================================================================

/// Everything one root deployment produced
#[derive(Debug, Clone)]
pub struct ExpandedDeployment {
    pub name: String,
    /// Emitted resources, nested deployment resources followed by their children
    pub resources: Vec<ResourceValue>,
    pub outputs: Map<String, Value>,
    /// Resources and outputs that failed locally
    pub failures: Vec<ExpansionFailure>,
    pub diagnostics: Vec<Diagnostic>,
    /// Symbols of the root deployment
    pub symbols: SymbolTable,
}

impl ExpandedDeployment {
    pub fn try_output(&self, name: &str) -> Option<&Value> {
        get_property(&self.outputs, name)
    }

    pub fn output<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.try_output(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn resource(&self, id: &str) -> Option<&ResourceValue> {
        self.resources
            .iter()
            .find(|r| arm_expr::ids::ids_equal(&r.id, id))
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Policy and policy set definitions not covered by `index`
    pub fn policy_definitions<'a>(
        &'a self,
        index: &'a PolicyIgnoreIndex,
    ) -> impl Iterator<Item = &'a ResourceValue> + 'a {
        self.resources.iter().filter(move |r| {
            r.is_policy_definition()
                && !index.is_ignored(&r.id)
                && !index.is_ignored(&format!("/providers/{}/{}", r.resource_type, r.name))
        })
    }

    /// The emitted resources as a JSON array
    pub fn to_json(&self) -> Value {
        Value::Array(self.resources.iter().map(ResourceValue::to_json).collect())
    }
}

// ============================================================================
// Context
// ============================================================================

enum Instance {
    Emitted {
        resource: ResourceValue,
        nested: Option<ExpandedDeployment>,
    },
    Existing(ResourceValue),
    /// Condition was false; the id when it could be computed
    Skipped(Option<String>),
}

enum Readiness {
    Ready,
    Waiting,
    Failed(String),
}

pub struct DeploymentContext {
    scope: DeploymentScope,
    expander: Expander,
    depth: usize,
    /// Per declaration: declarations it waits for
    dependencies: Vec<Vec<usize>>,
    /// Per declaration: ids of its emitted instances
    instance_ids: Vec<Vec<String>>,
    emitted: Vec<ResourceValue>,
    failures: Vec<ExpansionFailure>,
}

impl DeploymentContext {
    pub fn new(
        expander: Expander,
        template: Template,
        identity: DeploymentIdentity,
        parameters: Map<String, Value>,
        depth: usize,
    ) -> Result<Self> {
        let template = Arc::new(template);
        let count = template.resources.len();
        let scope = DeploymentScope::new(
            Arc::clone(&template),
            Arc::clone(&expander.options),
            Arc::clone(&expander.sink),
            identity,
            parameters,
        )?;
        Ok(Self {
            scope,
            expander,
            depth,
            dependencies: vec![Vec::new(); count],
            instance_ids: vec![Vec::new(); count],
            emitted: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub fn scope(&self) -> &DeploymentScope {
        &self.scope
    }

    #[instrument(skip(self), fields(deployment = %self.scope.identity.name, depth = self.depth))]
    pub fn expand(mut self) -> Result<ExpandedDeployment> {
        self.declare_symbols()?;
        self.collect_known_identities();
        let order = self.plan()?;
        self.run_passes(order)?;
        let outputs = self.evaluate_outputs()?;

        info!(
            resources = self.emitted.len(),
            failures = self.failures.len(),
            outputs = outputs.len(),
            "expanded deployment"
        );
        Ok(ExpandedDeployment {
            name: self.scope.identity.name.clone(),
            resources: self.emitted,
            outputs,
            failures: self.failures,
            diagnostics: self.scope.diagnostics,
            symbols: self.scope.symbols,
        })
    }

    // ------------------------------------------------------------------------
    // Symbols and identities
    // ------------------------------------------------------------------------

    fn declare_symbols(&mut self) -> Result<()> {
        let template = Arc::clone(&self.scope.template);
        for decl in &template.resources {
            match (decl.symbol(), &decl.copy) {
                (Some(symbol), Some(_)) => self.scope.symbols.declare_array(symbol)?,
                (Some(symbol), None) => self.scope.symbols.declare_object(symbol, None)?,
                (None, _) => {}
            }
        }
        Ok(())
    }

    /// Best effort: anything that cannot be evaluated yet is left out
    fn collect_known_identities(&mut self) {
        let template = Arc::clone(&self.scope.template);
        for decl in &template.resources {
            for identity in self.preview_identities(decl) {
                self.scope.known.push(KnownIdentity {
                    declaration: decl.ordinal,
                    id: identity.id,
                    name: identity.name,
                });
            }
        }
    }

    fn preview_identities(&mut self, decl: &ResourceDeclaration) -> Vec<ResourceIdentity> {
        let Some(copy) = &decl.copy else {
            return self.preview_identity(decl).into_iter().collect();
        };
        let pointer = format!("{}/copy/count", decl.pointer);
        let Ok(count) = self.scope.evaluate_count(&copy.count, &pointer) else {
            return Vec::new();
        };
        (0..count)
            .filter_map(|index| {
                self.scope.push_copy_frame(&copy.name, index);
                let identity = self.preview_identity(decl);
                self.scope.pop_copy_frame();
                identity
            })
            .collect()
    }

    fn preview_identity(&mut self, decl: &ResourceDeclaration) -> Option<ResourceIdentity> {
        let fields: Map<String, Value> = IDENTITY_FIELDS
            .iter()
            .filter_map(|f| get_property(&decl.body, f).map(|v| (f.to_string(), v.clone())))
            .collect();
        let evaluated = self
            .scope
            .evaluate_json(&Value::Object(fields), &decl.pointer)
            .ok()?;
        let evaluated = evaluated.as_object()?;
        identity_from_body(&self.scope, decl, evaluated).ok()
    }

    // ------------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------------

    fn plan(&mut self) -> Result<Vec<usize>> {
        let template = Arc::clone(&self.scope.template);
        let mut nodes = Vec::with_capacity(template.resources.len());

        for decl in &template.resources {
            let mut depends_on: Vec<usize> = decl.parent.into_iter().collect();
            for text in self.dependency_texts(decl) {
                let matched = self.match_dependency(&text);
                if matched.is_empty() {
                    let pointer = format!("{}/dependsOn", decl.pointer);
                    self.scope
                        .report_at(&pointer, unmatched_dependency_warning(&decl.describe(), &text));
                }
                for target in matched {
                    if target != decl.ordinal && !depends_on.contains(&target) {
                        depends_on.push(target);
                    }
                }
            }

            let label = self
                .scope
                .known
                .iter()
                .find(|k| k.declaration == decl.ordinal)
                .map(|k| k.id.clone())
                .unwrap_or_else(|| decl.describe());
            self.dependencies[decl.ordinal] = depends_on.clone();
            nodes.push(DependencyNode {
                ordinal: decl.ordinal,
                label,
                depends_on,
            });
        }

        expansion_order(&nodes)
    }

    /// Evaluated `dependsOn` entries; iterated declarations are evaluated
    /// once per index so entries may use `copyIndex()`
    fn dependency_texts(&mut self, decl: &ResourceDeclaration) -> Vec<String> {
        if decl.depends_on.is_empty() {
            return Vec::new();
        }
        let count = decl.copy.as_ref().map(|copy| {
            let pointer = format!("{}/copy/count", decl.pointer);
            (copy, self.scope.evaluate_count(&copy.count, &pointer).unwrap_or(0))
        });

        let mut texts = Vec::new();
        let mut collect = |scope: &mut DeploymentScope| {
            for (i, entry) in decl.depends_on.iter().enumerate() {
                let pointer = format!("{}/dependsOn/{}", decl.pointer, i);
                let text = match scope.evaluate_json(entry, &pointer) {
                    Ok(Value::String(s)) => s,
                    Ok(other) => to_display_string(&other),
                    Err(e) => {
                        debug!(resource = %decl.describe(), error = %e, "dependsOn entry not evaluated");
                        entry.as_str().unwrap_or_default().to_string()
                    }
                };
                if !text.is_empty() && !texts.contains(&text) {
                    texts.push(text);
                }
            }
        };

        match count {
            None => collect(&mut self.scope),
            Some((copy, count)) => {
                for index in 0..count {
                    self.scope.with_copy_frame(&copy.name, index, &mut collect);
                }
            }
        }
        texts
    }

    /// Declarations a `dependsOn` entry names: a symbol, a resource id, a
    /// resource name, or the trailing segments of an id
    fn match_dependency(&self, text: &str) -> Vec<usize> {
        let suffix = format!("/{}", text.to_ascii_lowercase());
        let mut matched: Vec<usize> = self
            .scope
            .template
            .resources
            .iter()
            .filter(|d| d.symbol().is_some_and(|s| s.eq_ignore_ascii_case(text)))
            .map(|d| d.ordinal)
            .collect();
        for known in &self.scope.known {
            let hit = arm_expr::ids::ids_equal(&known.id, text)
                || known.name.eq_ignore_ascii_case(text)
                || known.id.to_ascii_lowercase().ends_with(&suffix);
            if hit && !matched.contains(&known.declaration) {
                matched.push(known.declaration);
            }
        }
        matched
    }

    // ------------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------------

    fn run_passes(&mut self, order: Vec<usize>) -> Result<()> {
        // every pass that makes progress settles at least one declaration
        let mut pending = order;
        let mut pass = 0;

        while !pending.is_empty() {
            pass += 1;
            debug!(pass, pending = pending.len(), "expansion pass");

            let mut deferred = Vec::new();
            let mut progressed = false;
            for ordinal in pending {
                match self.readiness(ordinal) {
                    Readiness::Waiting => {
                        deferred.push(ordinal);
                        continue;
                    }
                    Readiness::Failed(dependency) => {
                        self.fail(ordinal, ExpandError::DependencyFailed { dependency });
                        progressed = true;
                        continue;
                    }
                    Readiness::Ready => {}
                }

                match self.expand_declaration(ordinal) {
                    Ok(()) => progressed = true,
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) if e.is_unresolved() => {
                        debug!(declaration = ordinal, error = %e, "deferred to next pass");
                        deferred.push(ordinal);
                    }
                    Err(e) => {
                        self.fail(ordinal, e);
                        progressed = true;
                    }
                }
            }

            if !progressed && !deferred.is_empty() {
                return Err(self.cycle_error(&deferred));
            }
            pending = deferred;
        }
        Ok(())
    }

    fn readiness(&self, ordinal: usize) -> Readiness {
        let template = &self.scope.template;
        for &dependency in &self.dependencies[ordinal] {
            match self.scope.states[dependency] {
                DeclarationState::Failed => {
                    return Readiness::Failed(template.resources[dependency].describe())
                }
                DeclarationState::Pending => return Readiness::Waiting,
                DeclarationState::Expanded | DeclarationState::Skipped => {}
            }
        }
        Readiness::Ready
    }

    fn cycle_error(&self, remaining: &[usize]) -> ExpandError {
        let mut remaining = remaining.to_vec();
        remaining.sort_unstable();
        let ids = remaining
            .iter()
            .map(|&ordinal| {
                self.scope
                    .known
                    .iter()
                    .find(|k| k.declaration == ordinal)
                    .map(|k| k.id.clone())
                    .unwrap_or_else(|| self.scope.template.resources[ordinal].describe())
            })
            .collect();
        ExpandError::CyclicDependency { ids }
    }

    fn fail(&mut self, ordinal: usize, error: ExpandError) {
        let decl = &self.scope.template.resources[ordinal];
        let pointer = decl.pointer.clone();
        let failure = ExpansionFailure {
            deployment: self.scope.identity.name.clone(),
            subject: FailureSubject::Resource(decl.describe()),
            error,
        };
        self.scope.states[ordinal] = DeclarationState::Failed;
        self.scope.report_at(
            &pointer,
            Diagnostic::error(DiagnosticCode::ResourceFailed, failure.to_string()),
        );
        self.failures.push(failure);
    }

    // ------------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------------

    fn expand_declaration(&mut self, ordinal: usize) -> Result<()> {
        let template = Arc::clone(&self.scope.template);
        let decl = &template.resources[ordinal];
        debug!(resource = %decl.describe(), "expanding declaration");

        let instances = match &decl.copy {
            None => vec![self.expand_instance(decl, None)?],
            Some(copy) => {
                let pointer = format!("{}/copy/count", decl.pointer);
                let count = self.scope.evaluate_count(&copy.count, &pointer)?;
                let mut instances = Vec::with_capacity(count);
                for index in 0..count {
                    self.scope.push_copy_frame(&copy.name, index);
                    let instance = self.expand_instance(decl, Some(index));
                    self.scope.pop_copy_frame();
                    instances.push(instance?);
                }
                instances
            }
        };
        self.commit(decl, instances)
    }

    fn expand_instance(
        &mut self,
        decl: &ResourceDeclaration,
        index: Option<usize>,
    ) -> Result<Instance> {
        if let Some(condition) = &decl.condition {
            let pointer = format!("{}/condition", decl.pointer);
            match self.scope.evaluate_json(condition, &pointer)? {
                Value::Bool(true) => {}
                Value::Bool(false) => {
                    let id = self.preview_identity(decl).map(|i| i.id);
                    return Ok(Instance::Skipped(id));
                }
                other => {
                    return Err(ExpandError::expression(
                        pointer,
                        ExpressionError::type_mismatch("condition", "bool", &other),
                    ))
                }
            }
        }

        let is_deployment = decl
            .raw_type()
            .is_some_and(|t| t.eq_ignore_ascii_case(DEPLOYMENT_TYPE));
        let mut raw = decl.body.clone();
        let inline_template = if is_deployment {
            take_inline_template(&mut raw)
        } else {
            None
        };

        let mut body = match self.scope.evaluate_json(&Value::Object(raw), &decl.pointer)? {
            Value::Object(body) => body,
            other => {
                return Err(ExpandError::malformed(
                    &decl.pointer,
                    format!("resource evaluated to {}", type_name(&other)),
                ))
            }
        };
        let identity = identity_from_body(&self.scope, decl, &body)?;
        let deployment = self.scope.identity.name.clone();

        if decl.existing {
            let resource = ResourceValue::new(identity, body, Vec::new(), deployment)
                .with_symbolic_name(decl.symbolic_name.as_deref())
                .with_copy_index(index.map(|i| i as i64));
            return Ok(Instance::Existing(resource));
        }

        let nested = if is_deployment {
            self.expand_nested(decl, &identity, &mut body, inline_template)?
        } else {
            None
        };

        let keep = self.scope.options.keep_secret_properties;
        let mut redacted = Vec::new();
        if !keep {
            for (key, value) in body.iter_mut() {
                if key.eq_ignore_ascii_case("name") || key.eq_ignore_ascii_case("type") {
                    continue;
                }
                redact_secure_values(value, self.scope.secure_values(), key, &mut redacted);
            }
        }
        redacted.extend(
            self.expander
                .secrets
                .redact(&identity.resource_type, &mut body, keep),
        );
        if !redacted.is_empty() {
            debug!(id = %identity.id, paths = ?redacted, "redacted secret values");
        }

        let resource = ResourceValue::new(
            identity,
            body,
            self.resolved_dependencies(decl.ordinal),
            deployment,
        )
        .with_symbolic_name(decl.symbolic_name.as_deref())
        .with_copy_index(index.map(|i| i as i64))
        .with_redacted(redacted);
        Ok(Instance::Emitted { resource, nested })
    }

    /// Ids of every emitted instance of the declarations `ordinal` waits for
    fn resolved_dependencies(&self, ordinal: usize) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for &dependency in &self.dependencies[ordinal] {
            for id in &self.instance_ids[dependency] {
                if !ids.iter().any(|i| arm_expr::ids::ids_equal(i, id)) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Bind symbols and publish instances; only reached once every instance
    /// of the declaration expanded
    fn commit(&mut self, decl: &ResourceDeclaration, instances: Vec<Instance>) -> Result<()> {
        let mut all_skipped = !instances.is_empty();
        for instance in instances {
            match instance {
                Instance::Emitted { resource, nested } => {
                    all_skipped = false;
                    if let Some(symbol) = decl.symbol() {
                        self.scope.symbols.configure(symbol, resource.id.clone())?;
                    }
                    self.instance_ids[decl.ordinal].push(resource.id.clone());
                    self.scope.resources.push(resource.clone());
                    self.emitted.push(resource);
                    if let Some(nested) = nested {
                        self.emitted.extend(nested.resources);
                        self.failures.extend(nested.failures);
                        self.scope.diagnostics.extend(nested.diagnostics);
                    }
                }
                Instance::Existing(resource) => {
                    all_skipped = false;
                    if let Some(symbol) = decl.symbol() {
                        self.scope.symbols.configure(symbol, resource.id.clone())?;
                    }
                    self.scope.existing.push(resource);
                }
                Instance::Skipped(id) => {
                    let Some(id) = id else { continue };
                    // keeps `name[i]` aligned with the loop index
                    if decl.copy.is_some() {
                        if let Some(symbol) = decl.symbol() {
                            self.scope.symbols.configure(symbol, id.clone())?;
                        }
                    }
                    self.scope.skipped.push(id);
                }
            }
        }
        self.scope.states[decl.ordinal] = if all_skipped {
            DeclarationState::Skipped
        } else {
            DeclarationState::Expanded
        };
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Nested deployments
    // ------------------------------------------------------------------------

    fn expand_nested(
        &mut self,
        decl: &ResourceDeclaration,
        identity: &ResourceIdentity,
        body: &mut Map<String, Value>,
        inline_template: Option<Value>,
    ) -> Result<Option<ExpandedDeployment>> {
        let template_value = match inline_template {
            Some(template) => {
                insert_property(body, "template", template.clone());
                Some(template)
            }
            None => self.load_linked(decl, identity, body),
        };
        let Some(template_value) = template_value else {
            return Ok(None);
        };

        let template = Template::from_value(&template_value)?;
        let max_depth = self.scope.options.max_depth;
        if self.depth + 1 > max_depth {
            return Err(ExpandError::DepthExceeded {
                name: identity.name.clone(),
                max_depth,
            });
        }

        let parameters = self.nested_parameters(identity, body);
        let child_identity = self.nested_identity(identity, body, template.scope_level);
        debug!(deployment = %identity.name, "expanding nested deployment");

        let child = DeploymentContext::new(
            self.expander.clone(),
            template,
            child_identity,
            parameters,
            self.depth + 1,
        )?;
        let expanded = child.expand()?;

        let outputs: Map<String, Value> = expanded
            .outputs
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    json!({ "type": output_type_name(value), "value": value }),
                )
            })
            .collect();
        insert_property(body, "outputs", Value::Object(outputs));
        Ok(Some(expanded))
    }

    fn load_linked(
        &mut self,
        decl: &ResourceDeclaration,
        identity: &ResourceIdentity,
        body: &Map<String, Value>,
    ) -> Option<Value> {
        let pointer = format!("{}/properties/templateLink", decl.pointer);
        let link = body
            .get("properties")
            .and_then(Value::as_object)
            .and_then(|p| get_property(p, "templateLink"))
            .and_then(Value::as_object);
        let Some(link) = link else {
            self.scope.report_at(
                &pointer,
                linked_template_warning(&identity.name, "no template or templateLink"),
            );
            return None;
        };
        let reference = ["uri", "relativePath", "id"]
            .iter()
            .find_map(|key| get_property(link, key).and_then(Value::as_str));
        let Some(reference) = reference else {
            self.scope.report_at(
                &pointer,
                linked_template_warning(&identity.name, "templateLink has no uri"),
            );
            return None;
        };
        let Some(loader) = self.expander.loader.clone() else {
            self.scope.report_at(
                &pointer,
                linked_template_warning(&identity.name, "no template loader is configured"),
            );
            return None;
        };

        let loaded = loader
            .load(reference)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()));
        match loaded {
            Ok(template) => Some(template),
            Err(reason) => {
                self.scope
                    .report_at(&pointer, linked_template_warning(&identity.name, &reason));
                None
            }
        }
    }

    fn nested_parameters(
        &self,
        identity: &ResourceIdentity,
        body: &Map<String, Value>,
    ) -> Map<String, Value> {
        let entries = body
            .get("properties")
            .and_then(Value::as_object)
            .and_then(|p| get_property(p, "parameters"))
            .and_then(Value::as_object);
        let mut parameters = Map::new();
        for (name, entry) in entries.into_iter().flatten() {
            match parameter_value(entry) {
                Some(value) => {
                    parameters.insert(name.clone(), value);
                }
                None => warn!(
                    deployment = %identity.name,
                    parameter = %name,
                    "parameter has neither 'value' nor 'reference'"
                ),
            }
        }
        parameters
    }

    fn nested_identity(
        &self,
        identity: &ResourceIdentity,
        body: &Map<String, Value>,
        scope_level: ScopeLevel,
    ) -> DeploymentIdentity {
        let parent = &self.scope.identity;
        let text = |key: &str, fallback: &str| {
            get_property(body, key)
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        DeploymentIdentity {
            name: identity.name.clone(),
            subscription_id: text("subscriptionId", &parent.subscription_id),
            subscription_display_name: parent.subscription_display_name.clone(),
            tenant_id: parent.tenant_id.clone(),
            resource_group: text("resourceGroup", &parent.resource_group),
            location: text("location", &parent.location),
            management_group: parent.management_group.clone(),
            scope_level,
            parent: Some(parent.name.clone()),
        }
    }

    // ------------------------------------------------------------------------
    // Outputs
    // ------------------------------------------------------------------------

    fn evaluate_outputs(&mut self) -> Result<Map<String, Value>> {
        let template = Arc::clone(&self.scope.template);
        let mut outputs = Map::new();
        for output in &template.outputs {
            let pointer = format!("/outputs/{}", output.name);
            match self.evaluate_output(output, &pointer) {
                Ok(Some(value)) => {
                    outputs.insert(output.name.clone(), value);
                }
                Ok(None) => debug!(output = %output.name, "output condition is false"),
                Err(e) if e.is_structural() => return Err(e),
                Err(error) => {
                    let failure = ExpansionFailure {
                        deployment: self.scope.identity.name.clone(),
                        subject: FailureSubject::Output(output.name.clone()),
                        error,
                    };
                    self.scope.report_at(
                        &pointer,
                        Diagnostic::error(DiagnosticCode::OutputFailed, failure.to_string()),
                    );
                    self.failures.push(failure);
                }
            }
        }
        Ok(outputs)
    }

    fn evaluate_output(&mut self, output: &OutputDefinition, pointer: &str) -> Result<Option<Value>> {
        if let Some(condition) = &output.condition {
            let condition_pointer = format!("{}/condition", pointer);
            match self.scope.evaluate_json(condition, &condition_pointer)? {
                Value::Bool(true) => {}
                Value::Bool(false) => return Ok(None),
                other => {
                    return Err(ExpandError::expression(
                        condition_pointer,
                        ExpressionError::type_mismatch("condition", "bool", &other),
                    ))
                }
            }
        }

        let value = match (&output.copy, &output.value) {
            (Some(copy), _) => {
                let count = self
                    .scope
                    .evaluate_count(&copy.count, &format!("{}/copy/count", pointer))?;
                let input_pointer = format!("{}/copy/input", pointer);
                let mut items = Vec::with_capacity(count);
                for index in 0..count {
                    items.push(self.scope.with_copy_frame(&output.name, index, |scope| {
                        scope.evaluate_json(&copy.input, &input_pointer)
                    })?);
                }
                Value::Array(items)
            }
            (None, Some(value)) => self.scope.evaluate_json(value, &format!("{}/value", pointer))?,
            (None, None) => Value::Null,
        };

        if let Some(expected) = output.output_type {
            if !value.is_null() && !expected.accepts(&value) {
                return Err(ExpandError::expression(
                    pointer,
                    ExpressionError::type_mismatch(
                        format!("output '{}'", output.name),
                        expected.as_str(),
                        &value,
                    ),
                ));
            }
        }
        Ok(Some(value))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Identity of an evaluated declaration. Resource group and subscription
/// overrides only apply to deployments and `existing` references.
fn identity_from_body(
    scope: &DeploymentScope,
    decl: &ResourceDeclaration,
    body: &Map<String, Value>,
) -> Result<ResourceIdentity> {
    let text = |key: &str| {
        let value = get_property(body, key).unwrap_or(&Value::Null);
        value.as_str().ok_or_else(|| {
            ExpandError::expression(
                format!("{}/{}", decl.pointer, key),
                ExpressionError::type_mismatch(format!("resource {}", key), "string", value),
            )
        })
    };
    let resource_type = text("type")?;
    let name = text("name")?;
    let extension_scope = get_property(body, "scope").and_then(Value::as_str);

    let overrides = decl.existing || resource_type.eq_ignore_ascii_case(DEPLOYMENT_TYPE);
    let optional = |key: &str| {
        if overrides {
            get_property(body, key).and_then(Value::as_str)
        } else {
            None
        }
    };

    scope
        .resource_identity(
            resource_type,
            name,
            extension_scope,
            optional("resourceGroup"),
            optional("subscriptionId"),
        )
        .map_err(|e| ExpandError::expression(&decl.pointer, e))
}

/// Remove `properties.template` so it is not evaluated in the parent scope
fn take_inline_template(body: &mut Map<String, Value>) -> Option<Value> {
    let properties = body.get_mut("properties")?.as_object_mut()?;
    let key = arm_expr::value::find_key(properties, "template")?.to_string();
    properties.remove(&key)
}

fn insert_property(body: &mut Map<String, Value>, key: &str, value: Value) {
    let properties = body
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    match properties {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
        }
        other => *other = json!({ key: value }),
    }
}

/// Output type as the deployment engine reports it
fn output_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "String",
        Value::Number(_) => "Int",
        Value::Bool(_) => "Bool",
        Value::Array(_) => "Array",
        Value::Object(_) | Value::Null => "Object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    fn expand(template: Value) -> ExpandedDeployment {
        let expander = Expander::new(ExpansionOptions::default()).unwrap();
        expander
            .expand(&Template::from_value(&template).unwrap(), Map::new())
            .unwrap()
    }

    #[test]
    fn test_forward_reference_is_deferred() {
        let result = expand(json!({
            "resources": [
                {
                    "type": "Microsoft.Web/sites",
                    "apiVersion": "2022-09-01",
                    "name": "app",
                    "properties": {
                        "serverFarmId": "[resourceId('Microsoft.Web/serverfarms', 'plan')]",
                        "sku": "[reference(resourceId('Microsoft.Web/serverfarms', 'plan')).tier]"
                    }
                },
                {
                    "type": "Microsoft.Web/serverfarms",
                    "apiVersion": "2022-09-01",
                    "name": "plan",
                    "properties": { "tier": "Standard" }
                }
            ]
        }));
        assert!(result.is_complete());
        let names: Vec<&str> = result.resources.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["plan", "app"]);
        assert_eq!(result.resources[1].properties()["sku"], json!("Standard"));
    }

    #[test]
    fn test_child_resources_depend_on_parent() {
        let result = expand(json!({
            "resources": [{
                "type": "Microsoft.Network/virtualNetworks",
                "apiVersion": "2023-04-01",
                "name": "vnet",
                "resources": [{
                    "type": "subnets",
                    "apiVersion": "2023-04-01",
                    "name": "default",
                    "properties": {}
                }]
            }]
        }));
        assert_eq!(result.resources.len(), 2);
        let subnet = &result.resources[1];
        assert_eq!(subnet.resource_type, "Microsoft.Network/virtualNetworks/subnets");
        assert_eq!(subnet.name, "vnet/default");
        assert_eq!(subnet.depends_on, vec![result.resources[0].id.clone()]);
    }

    #[test]
    fn test_condition_false_skips_and_satisfies_dependents() {
        let result = expand(json!({
            "resources": [
                {
                    "condition": false,
                    "type": "Microsoft.Storage/storageAccounts",
                    "apiVersion": "2023-01-01",
                    "name": "sa"
                },
                {
                    "type": "Microsoft.Insights/diagnosticSettings",
                    "apiVersion": "2021-05-01-preview",
                    "name": "diag",
                    "dependsOn": ["sa"]
                }
            ]
        }));
        assert!(result.is_complete());
        assert_eq!(result.resources.len(), 1);
        assert!(result.resources[0].depends_on.is_empty());
    }

    #[test]
    fn test_failure_is_local() {
        let result = expand(json!({
            "resources": [
                {
                    "type": "Microsoft.Storage/storageAccounts",
                    "apiVersion": "2023-01-01",
                    "name": "[add(9223372036854775807, 1)]"
                },
                {
                    "type": "Microsoft.KeyVault/vaults",
                    "apiVersion": "2023-02-01",
                    "name": "kv"
                }
            ]
        }));
        assert_eq!(result.resources.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].kind(), ErrorKind::NumericOverflow);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.code == DiagnosticCode::ResourceFailed));
    }

    #[test]
    fn test_output_copy_and_type_check() {
        let result = expand(json!({
            "outputs": {
                "names": {
                    "type": "array",
                    "copy": { "count": 2, "input": "[format('n{0}', copyIndex())]" }
                },
                "wrong": { "type": "int", "value": "text" },
                "hidden": { "condition": false, "type": "string", "value": "x" }
            }
        }));
        assert_eq!(result.output::<Vec<String>>("names").unwrap(), vec!["n0", "n1"]);
        assert!(result.try_output("hidden").is_none());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(
            result.failures[0].subject,
            FailureSubject::Output("wrong".into())
        );
    }

    #[test]
    fn test_depth_limit() {
        let options = ExpansionOptions {
            max_depth: 1,
            ..ExpansionOptions::default()
        };
        let nested = |inner: Value| {
            json!({
                "resources": [{
                    "type": "Microsoft.Resources/deployments",
                    "apiVersion": "2022-09-01",
                    "name": "inner",
                    "properties": { "mode": "Incremental", "template": inner }
                }]
            })
        };
        let template = nested(nested(json!({ "resources": [] })));
        let err = Expander::new(options)
            .unwrap()
            .expand(&Template::from_value(&template).unwrap(), Map::new())
            .unwrap_err();
        assert!(matches!(err, ExpandError::DepthExceeded { max_depth: 1, .. }));
    }

    #[test]
    fn test_output_type_names() {
        assert_eq!(output_type_name(&json!("a")), "String");
        assert_eq!(output_type_name(&json!(1)), "Int");
        assert_eq!(output_type_name(&json!([])), "Array");
    }
}
