//! Resource Value
//!
//! One expanded resource instance. Built in full by the deployment context
//! before its id is bound in the symbol table, and never mutated afterwards.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::policy::{classify, PolicyDefinitionKind};

/// Where a resource lives and what it is called
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Id of the scope the resource is deployed into
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceValue {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub api_version: Option<String>,
    pub scope: String,
    pub symbolic_name: Option<String>,
    pub copy_index: Option<i64>,
    pub depends_on: Vec<String>,
    /// Name of the deployment that declared the resource
    pub deployment: String,
    pub policy_kind: PolicyDefinitionKind,
    /// Paths whose values were replaced by a secret placeholder
    pub redacted: Vec<String>,
    #[serde(skip)]
    body: Map<String, Value>,
}

impl ResourceValue {
    /// Assemble the emitted body: `id` first, then the evaluated declaration,
    /// with `scope` and the resolved `dependsOn` added and nulls trimmed.
    pub fn new(
        identity: ResourceIdentity,
        evaluated: Map<String, Value>,
        depends_on: Vec<String>,
        deployment: impl Into<String>,
    ) -> Self {
        let mut body = Map::new();
        body.insert("id".into(), Value::String(identity.id.clone()));
        for (key, value) in evaluated {
            if key.eq_ignore_ascii_case("id")
                || key.eq_ignore_ascii_case("scope")
                || key.eq_ignore_ascii_case("dependsOn")
            {
                continue;
            }
            body.insert(key, value);
        }
        body.insert("name".into(), Value::String(identity.name.clone()));
        body.insert("type".into(), Value::String(identity.resource_type.clone()));
        body.insert("scope".into(), Value::String(identity.scope.clone()));
        if !depends_on.is_empty() {
            body.insert(
                "dependsOn".into(),
                Value::Array(depends_on.iter().cloned().map(Value::String).collect()),
            );
        }
        trim_nulls(&mut body);

        let api_version = body
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(str::to_string);

        ResourceValue {
            policy_kind: classify(&identity.resource_type),
            id: identity.id,
            name: identity.name,
            resource_type: identity.resource_type,
            api_version,
            scope: identity.scope,
            symbolic_name: None,
            copy_index: None,
            depends_on,
            deployment: deployment.into(),
            redacted: Vec::new(),
            body,
        }
    }

    pub fn with_symbolic_name(mut self, name: Option<&str>) -> Self {
        self.symbolic_name = name.map(str::to_string);
        self
    }

    pub fn with_copy_index(mut self, index: Option<i64>) -> Self {
        self.copy_index = index;
        self
    }

    pub fn with_redacted(mut self, redacted: Vec<String>) -> Self {
        self.redacted = redacted;
        self
    }

    /// The emitted resource object
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// `properties` of the emitted body, or an empty object
    pub fn properties(&self) -> Value {
        self.body
            .get("properties")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.body.clone())
    }

    /// `{id, name, type, apiVersion}` as returned by `resourceInfo()`
    pub fn info(&self) -> Value {
        let mut info = Map::new();
        info.insert("id".into(), Value::String(self.id.clone()));
        info.insert("name".into(), Value::String(self.name.clone()));
        info.insert("type".into(), Value::String(self.resource_type.clone()));
        if let Some(api_version) = &self.api_version {
            info.insert("apiVersion".into(), Value::String(api_version.clone()));
        }
        Value::Object(info)
    }

    pub fn is_policy_definition(&self) -> bool {
        self.policy_kind != PolicyDefinitionKind::Unknown
    }
}

/// Remove null-valued object members at any depth; array items are kept
pub fn trim_nulls(object: &mut Map<String, Value>) {
    object.retain(|_, v| !v.is_null());
    for value in object.values_mut() {
        trim_value(value);
    }
}

fn trim_value(value: &mut Value) {
    match value {
        Value::Object(object) => trim_nulls(object),
        Value::Array(items) => items.iter_mut().for_each(trim_value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn identity() -> ResourceIdentity {
        ResourceIdentity {
            id: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/sa".into(),
            name: "sa".into(),
            resource_type: "Microsoft.Storage/storageAccounts".into(),
            scope: "/subscriptions/s/resourceGroups/rg".into(),
        }
    }

    #[test]
    fn test_emitted_body() {
        let evaluated = json!({
            "type": "Microsoft.Storage/storageAccounts",
            "apiVersion": "2023-01-01",
            "name": "sa",
            "location": "eastus",
            "tags": null,
            "properties": { "minimumTlsVersion": "TLS1_2", "encryption": null, "list": [null, 1] }
        });
        let rv = ResourceValue::new(
            identity(),
            evaluated.as_object().cloned().unwrap(),
            vec!["/x".into()],
            "main",
        );
        assert_eq!(rv.api_version.as_deref(), Some("2023-01-01"));
        assert_eq!(
            rv.to_json(),
            json!({
                "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/sa",
                "type": "Microsoft.Storage/storageAccounts",
                "apiVersion": "2023-01-01",
                "name": "sa",
                "location": "eastus",
                "properties": { "minimumTlsVersion": "TLS1_2", "list": [null, 1] },
                "scope": "/subscriptions/s/resourceGroups/rg",
                "dependsOn": ["/x"]
            })
        );
        assert_eq!(rv.properties()["minimumTlsVersion"], json!("TLS1_2"));
        assert_eq!(rv.policy_kind, PolicyDefinitionKind::Unknown);
    }

    #[test]
    fn test_policy_kind_recorded() {
        let rv = ResourceValue::new(
            ResourceIdentity {
                id: "/subscriptions/s/providers/Microsoft.Authorization/policyDefinitions/p".into(),
                name: "p".into(),
                resource_type: "Microsoft.Authorization/policyDefinitions".into(),
                scope: "/subscriptions/s".into(),
            },
            Map::new(),
            vec![],
            "main",
        );
        assert!(rv.is_policy_definition());
        assert_eq!(rv.properties(), json!({}));
        assert_eq!(rv.info()["name"], json!("p"));
    }
}
