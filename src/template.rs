//! Template model
//!
//! A parsed, not yet evaluated ARM template. Expressions are kept as raw JSON
//! and only evaluated by the deployment context. Parsing normalizes the two
//! resource shapes:
//! - array form (`"resources": [...]`), with nested child resources flattened
//!   into the list and made dependent on their parent
//! - symbolic form (`"resources": {"name": {...}}`, `languageVersion` 2.0)

use arm_expr::{is_expression, ScopeLevel};
use serde_json::{Map, Value};

use crate::error::{ExpandError, Result};

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    SecureString,
    Int,
    Bool,
    Object,
    SecureObject,
    Array,
}

impl ParameterType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "string" => Some(ParameterType::String),
            "securestring" => Some(ParameterType::SecureString),
            "int" => Some(ParameterType::Int),
            "bool" => Some(ParameterType::Bool),
            "object" => Some(ParameterType::Object),
            "secureobject" => Some(ParameterType::SecureObject),
            "array" => Some(ParameterType::Array),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::SecureString => "securestring",
            ParameterType::Int => "int",
            ParameterType::Bool => "bool",
            ParameterType::Object => "object",
            ParameterType::SecureObject => "secureObject",
            ParameterType::Array => "array",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, ParameterType::SecureString | ParameterType::SecureObject)
    }

    /// Whether `value` has this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParameterType::String | ParameterType::SecureString => value.is_string(),
            ParameterType::Int => value.is_i64(),
            ParameterType::Bool => value.is_boolean(),
            ParameterType::Object | ParameterType::SecureObject => value.is_object(),
            ParameterType::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDefinition {
    pub name: String,
    pub parameter_type: ParameterType,
    pub default_value: Option<Value>,
    pub allowed_values: Option<Vec<Value>>,
    pub nullable: bool,
}

// ============================================================================
// User-defined functions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct UserFunction {
    pub namespace: String,
    pub name: String,
    pub parameters: Vec<(String, ParameterType)>,
    pub output_type: ParameterType,
    pub output_value: Value,
}

impl UserFunction {
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.namespace.eq_ignore_ascii_case(namespace) && self.name.eq_ignore_ascii_case(name)
    }
}

// ============================================================================
// Resources
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CopyLoop {
    pub name: String,
    /// Raw `count`; may be an expression
    pub count: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    /// Key in symbolic-form templates
    pub symbolic_name: Option<String>,
    /// Position after flattening; breaks ordering ties
    pub ordinal: usize,
    /// JSON pointer of the declaration in the template
    pub pointer: String,
    /// Declaration without `copy`, `condition`, `existing`, `dependsOn`, `resources`
    pub body: Map<String, Value>,
    pub copy: Option<CopyLoop>,
    pub condition: Option<Value>,
    pub existing: bool,
    /// Raw `dependsOn` entries
    pub depends_on: Vec<Value>,
    /// Ordinal of the enclosing resource for flattened children
    pub parent: Option<usize>,
}

impl ResourceDeclaration {
    /// Name a symbol binds to: the symbolic name, else the copy loop name
    pub fn symbol(&self) -> Option<&str> {
        self.symbolic_name
            .as_deref()
            .or_else(|| self.copy.as_ref().map(|c| c.name.as_str()))
    }

    pub fn raw_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    pub fn raw_name(&self) -> Option<&str> {
        self.body.get("name").and_then(Value::as_str)
    }

    /// Short description for logs and cycle errors
    pub fn describe(&self) -> String {
        match (self.symbol(), self.raw_name()) {
            (Some(symbol), _) => symbol.to_string(),
            (None, Some(name)) => name.to_string(),
            (None, None) => self.pointer.clone(),
        }
    }
}

// ============================================================================
// Outputs
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OutputCopy {
    pub count: Value,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDefinition {
    pub name: String,
    pub output_type: Option<ParameterType>,
    pub value: Option<Value>,
    pub condition: Option<Value>,
    pub copy: Option<OutputCopy>,
}

// ============================================================================
// Template
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub schema: Option<String>,
    pub scope_level: ScopeLevel,
    pub language_version: Option<String>,
    pub content_version: Option<String>,
    pub parameters: Vec<ParameterDefinition>,
    /// Raw `variables`, including a top-level `copy` array if present
    pub variables: Map<String, Value>,
    pub functions: Vec<UserFunction>,
    pub resources: Vec<ResourceDeclaration>,
    pub outputs: Vec<OutputDefinition>,
    /// `resources` was an object keyed by symbolic name
    pub symbolic: bool,
    /// The template as given; exposed through `deployment().properties.template`
    pub raw: Value,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ExpandError::malformed("", format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| ExpandError::malformed("", "template must be a JSON object"))?;

        let schema = string_field(root, "$schema");
        let scope_level = schema
            .as_deref()
            .map(ScopeLevel::from_schema)
            .unwrap_or_default();

        let parameters = match field(root, "parameters") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(name, def)| parse_parameter(name, def))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(ExpandError::malformed("/parameters", "must be an object")),
        };

        let variables = match field(root, "variables") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(ExpandError::malformed("/variables", "must be an object")),
        };

        let functions = match field(root, "functions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => parse_functions(items)?,
            Some(_) => return Err(ExpandError::malformed("/functions", "must be an array")),
        };

        let (resources, symbolic) = match field(root, "resources") {
            None | Some(Value::Null) => (Vec::new(), false),
            Some(Value::Array(items)) => {
                let mut out = Vec::new();
                for (i, item) in items.iter().enumerate() {
                    flatten_resource(item, format!("/resources/{}", i), None, &mut out)?;
                }
                (out, false)
            }
            Some(Value::Object(map)) => {
                let mut out = Vec::new();
                for (name, item) in map {
                    let pointer = format!("/resources/{}", name);
                    let ordinal = out.len();
                    let mut decl = parse_resource(item, pointer, ordinal, None)?;
                    decl.symbolic_name = Some(name.clone());
                    out.push(decl);
                }
                (out, true)
            }
            Some(_) => {
                return Err(ExpandError::malformed(
                    "/resources",
                    "must be an array or an object",
                ))
            }
        };

        let outputs = match field(root, "outputs") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(name, def)| parse_output(name, def))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(ExpandError::malformed("/outputs", "must be an object")),
        };

        Ok(Template {
            schema,
            scope_level,
            language_version: string_field(root, "languageVersion"),
            content_version: string_field(root, "contentVersion"),
            parameters,
            variables,
            functions,
            resources,
            outputs,
            symbolic,
            raw: value.clone(),
        })
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDefinition> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn output(&self, name: &str) -> Option<&OutputDefinition> {
        self.outputs.iter().find(|o| o.name.eq_ignore_ascii_case(name))
    }

    pub fn user_function(&self, namespace: &str, name: &str) -> Option<&UserFunction> {
        self.functions.iter().find(|f| f.matches(namespace, name))
    }
}

/// Case-insensitive field lookup
fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    arm_expr::value::get_property(object, name)
}

fn string_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    field(object, name).and_then(Value::as_str).map(str::to_string)
}

fn parse_type(value: Option<&Value>, pointer: &str) -> Result<ParameterType> {
    let name = value
        .and_then(Value::as_str)
        .ok_or_else(|| ExpandError::malformed(pointer, "missing 'type'"))?;
    ParameterType::parse(name)
        .ok_or_else(|| ExpandError::malformed(pointer, format!("unknown type '{}'", name)))
}

fn parse_parameter(name: &str, def: &Value) -> Result<ParameterDefinition> {
    let pointer = format!("/parameters/{}", name);
    let def = def
        .as_object()
        .ok_or_else(|| ExpandError::malformed(&pointer, "must be an object"))?;

    let allowed_values = match field(def, "allowedValues") {
        None => None,
        Some(Value::Array(values)) => Some(values.clone()),
        Some(_) => {
            return Err(ExpandError::malformed(
                format!("{}/allowedValues", pointer),
                "must be an array",
            ))
        }
    };

    Ok(ParameterDefinition {
        name: name.to_string(),
        parameter_type: parse_type(field(def, "type"), &pointer)?,
        default_value: field(def, "defaultValue").cloned(),
        allowed_values,
        nullable: field(def, "nullable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

fn parse_functions(items: &[Value]) -> Result<Vec<UserFunction>> {
    let mut functions = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let pointer = format!("/functions/{}", i);
        let item = item
            .as_object()
            .ok_or_else(|| ExpandError::malformed(&pointer, "must be an object"))?;
        let namespace = string_field(item, "namespace")
            .ok_or_else(|| ExpandError::malformed(&pointer, "missing 'namespace'"))?;
        let members = field(item, "members")
            .and_then(Value::as_object)
            .ok_or_else(|| ExpandError::malformed(&pointer, "missing 'members'"))?;

        for (name, member) in members {
            let member_pointer = format!("{}/members/{}", pointer, name);
            let member = member
                .as_object()
                .ok_or_else(|| ExpandError::malformed(&member_pointer, "must be an object"))?;

            let mut parameters = Vec::new();
            if let Some(Value::Array(params)) = field(member, "parameters") {
                for (j, param) in params.iter().enumerate() {
                    let param_pointer = format!("{}/parameters/{}", member_pointer, j);
                    let param = param
                        .as_object()
                        .ok_or_else(|| ExpandError::malformed(&param_pointer, "must be an object"))?;
                    let param_name = string_field(param, "name")
                        .ok_or_else(|| ExpandError::malformed(&param_pointer, "missing 'name'"))?;
                    parameters.push((param_name, parse_type(field(param, "type"), &param_pointer)?));
                }
            }

            let output_pointer = format!("{}/output", member_pointer);
            let output = field(member, "output")
                .and_then(Value::as_object)
                .ok_or_else(|| ExpandError::malformed(&output_pointer, "missing 'output'"))?;

            functions.push(UserFunction {
                namespace: namespace.clone(),
                name: name.clone(),
                parameters,
                output_type: parse_type(field(output, "type"), &output_pointer)?,
                output_value: field(output, "value").cloned().unwrap_or(Value::Null),
            });
        }
    }
    Ok(functions)
}

fn parse_copy(value: &Value, pointer: &str) -> Result<CopyLoop> {
    let copy = value
        .as_object()
        .ok_or_else(|| ExpandError::malformed(pointer, "copy must be an object"))?;
    let name = string_field(copy, "name")
        .ok_or_else(|| ExpandError::malformed(pointer, "copy is missing 'name'"))?;
    let count = field(copy, "count")
        .cloned()
        .ok_or_else(|| ExpandError::malformed(pointer, "copy is missing 'count'"))?;
    Ok(CopyLoop { name, count })
}

const DECLARATION_KEYS: &[&str] = &["copy", "condition", "existing", "dependsOn", "resources"];

fn parse_resource(
    value: &Value,
    pointer: String,
    ordinal: usize,
    parent: Option<usize>,
) -> Result<ResourceDeclaration> {
    let object = value
        .as_object()
        .ok_or_else(|| ExpandError::malformed(&pointer, "resource must be an object"))?;

    if field(object, "type").and_then(Value::as_str).is_none() {
        return Err(ExpandError::malformed(&pointer, "resource is missing 'type'"));
    }

    let copy = field(object, "copy")
        .map(|c| parse_copy(c, &format!("{}/copy", pointer)))
        .transpose()?;

    let depends_on = match field(object, "dependsOn") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(ExpandError::malformed(
                format!("{}/dependsOn", pointer),
                "must be an array",
            ))
        }
    };

    let body = object
        .iter()
        .filter(|(k, _)| !DECLARATION_KEYS.iter().any(|d| d.eq_ignore_ascii_case(k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(ResourceDeclaration {
        symbolic_name: None,
        ordinal,
        pointer,
        body,
        copy,
        condition: field(object, "condition").cloned(),
        existing: field(object, "existing")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        depends_on,
        parent,
    })
}

/// Push `value` and, depth first, its child resources
fn flatten_resource(
    value: &Value,
    pointer: String,
    parent: Option<&ResourceDeclaration>,
    out: &mut Vec<ResourceDeclaration>,
) -> Result<()> {
    let ordinal = out.len();
    let mut decl = parse_resource(value, pointer.clone(), ordinal, parent.map(|p| p.ordinal))?;

    if let Some(parent) = parent {
        qualify_child(&mut decl, parent);
    }

    let children = value
        .as_object()
        .and_then(|o| field(o, "resources"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    out.push(decl.clone());
    for (i, child) in children.iter().enumerate() {
        flatten_resource(child, format!("{}/resources/{}", pointer, i), Some(&decl), out)?;
    }
    Ok(())
}

/// Prefix a child's short type and name with its parent's
fn qualify_child(child: &mut ResourceDeclaration, parent: &ResourceDeclaration) {
    let (Some(child_type), Some(parent_type)) = (child.raw_type(), parent.raw_type()) else {
        return;
    };
    if child_type.contains('/') {
        return;
    }
    let full_type = join_segments(parent_type, child_type);
    child.body.insert("type".into(), Value::String(full_type));

    if let (Some(child_name), Some(parent_name)) = (child.raw_name(), parent.raw_name()) {
        let full_name = join_segments(parent_name, child_name);
        child.body.insert("name".into(), Value::String(full_name));
    }
}

/// `a/b` for two literals, otherwise an equivalent `concat()` expression
pub fn join_segments(left: &str, right: &str) -> String {
    if !is_expression(left) && !is_expression(right) {
        return format!("{}/{}", left, unescape_literal(right));
    }
    format!(
        "[concat({}, '/', {})]",
        as_operand(left),
        as_operand(right)
    )
}

fn unescape_literal(s: &str) -> &str {
    if s.starts_with("[[") {
        &s[1..]
    } else {
        s
    }
}

fn as_operand(s: &str) -> String {
    if is_expression(s) {
        s[1..s.len() - 1].trim().to_string()
    } else {
        format!("'{}'", unescape_literal(s).replace('\'', "''"))
    }
}

fn parse_output(name: &str, def: &Value) -> Result<OutputDefinition> {
    let pointer = format!("/outputs/{}", name);
    let def = def
        .as_object()
        .ok_or_else(|| ExpandError::malformed(&pointer, "must be an object"))?;

    let output_type = match field(def, "type") {
        None => None,
        Some(t) => Some(parse_type(Some(t), &pointer)?),
    };

    let copy = match field(def, "copy") {
        None => None,
        Some(Value::Object(copy)) => Some(OutputCopy {
            count: field(copy, "count").cloned().ok_or_else(|| {
                ExpandError::malformed(format!("{}/copy", pointer), "missing 'count'")
            })?,
            input: field(copy, "input").cloned().ok_or_else(|| {
                ExpandError::malformed(format!("{}/copy", pointer), "missing 'input'")
            })?,
        }),
        Some(_) => {
            return Err(ExpandError::malformed(
                format!("{}/copy", pointer),
                "must be an object",
            ))
        }
    };

    Ok(OutputDefinition {
        name: name.to_string(),
        output_type,
        value: field(def, "value").cloned(),
        condition: field(def, "condition").cloned(),
        copy,
    })
}
