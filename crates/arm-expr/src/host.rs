//! The seam between the evaluator and deployment state
//!
//! The evaluator knows nothing about templates. Anything that depends on the
//! surrounding deployment (parameters, variables, copy loops, other
//! resources, the target scope) is asked of an [`ExpressionHost`].

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ExprResult, ExpressionError};
use crate::ids::ScopeLevel;

pub trait ExpressionHost {
    /// `parameters(name)`
    fn parameter(&mut self, name: &str) -> ExprResult<Value>;

    /// `variables(name)`
    fn variable(&mut self, name: &str) -> ExprResult<Value>;

    /// Current index of the named loop, or the innermost loop when `None`
    fn copy_index(&self, loop_name: Option<&str>) -> ExprResult<i64> {
        Err(ExpressionError::CopyIndexUnavailable {
            loop_name: loop_name.map(|s| s.to_string()),
        })
    }

    /// `reference(target)`; `full` returns the whole resource body
    fn reference(&mut self, target: &str, full: bool) -> ExprResult<Value> {
        let _ = full;
        Err(ExpressionError::UnresolvedSymbol {
            symbol: target.to_string(),
        })
    }

    /// `resourceInfo(symbol)`
    fn resource_info(&mut self, symbol: &str) -> ExprResult<Value> {
        Err(ExpressionError::UnresolvedSymbol {
            symbol: symbol.to_string(),
        })
    }

    /// `namespace.name(args)` from the template's `functions` section
    fn user_function(
        &mut self,
        namespace: &str,
        name: &str,
        args: Vec<Value>,
    ) -> ExprResult<Value> {
        let _ = args;
        Err(ExpressionError::UnknownFunction {
            name: format!("{}.{}", namespace, name),
            position: 0,
        })
    }

    fn deployment(&self) -> Value;
    fn subscription(&self) -> Value;
    fn resource_group(&self) -> Value;
    fn tenant(&self) -> Value;

    fn management_group(&self) -> Value {
        json!({})
    }

    fn environment(&self) -> Value {
        azure_cloud_environment()
    }

    fn scope_level(&self) -> ScopeLevel {
        ScopeLevel::ResourceGroup
    }

    fn utc_now(&self) -> DateTime<Utc>;

    fn new_guid(&mut self) -> Uuid;

    /// Non-fatal diagnostic raised during evaluation
    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
    }
}

/// Value returned by `environment()` for the public cloud
pub fn azure_cloud_environment() -> Value {
    json!({
        "name": "AzureCloud",
        "gallery": "https://gallery.azure.com/",
        "graph": "https://graph.windows.net/",
        "portal": "https://portal.azure.com",
        "graphAudience": "https://graph.windows.net/",
        "activeDirectoryDataLake": "https://datalake.azure.net/",
        "batch": "https://batch.core.windows.net/",
        "media": "https://rest.media.azure.net",
        "sqlManagement": "https://management.core.windows.net:8443/",
        "vmImageAliasDoc": "https://raw.githubusercontent.com/Azure/azure-rest-api-specs/master/arm-compute/quickstart-templates/aliases.json",
        "resourceManager": "https://management.azure.com/",
        "authentication": {
            "loginEndpoint": "https://login.microsoftonline.com/",
            "audiences": [
                "https://management.core.windows.net/",
                "https://management.azure.com/"
            ],
            "tenant": "common",
            "identityProvider": "AAD"
        },
        "suffixes": {
            "acrLoginServer": ".azurecr.io",
            "azureDatalakeAnalyticsCatalogAndJob": "azuredatalakeanalytics.net",
            "azureDatalakeStoreFileSystem": "azuredatalakestore.net",
            "azureFrontDoorEndpointSuffix": "azurefd.net",
            "keyvaultDns": ".vault.azure.net",
            "sqlServerHostname": ".database.windows.net",
            "storage": "core.windows.net"
        }
    })
}

/// Self-contained host for evaluating expressions outside a deployment
///
/// Holds fixed parameter and variable values and a fixed clock. Useful for
/// tooling and tests that only need the function catalog.
#[derive(Debug, Clone)]
pub struct StaticHost {
    pub parameters: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub copy_indexes: Vec<(Option<String>, i64)>,
    pub now: DateTime<Utc>,
    pub warnings: Vec<String>,
    guid_counter: u64,
}

impl Default for StaticHost {
    fn default() -> Self {
        Self {
            parameters: HashMap::new(),
            variables: HashMap::new(),
            copy_indexes: Vec::new(),
            now: Utc.timestamp_opt(0, 0).single().unwrap_or_default(),
            warnings: Vec::new(),
            guid_counter: 0,
        }
    }
}

impl StaticHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into().to_ascii_lowercase(), value);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into().to_ascii_lowercase(), value);
        self
    }

    pub fn with_copy_index(mut self, loop_name: Option<&str>, index: i64) -> Self {
        self.copy_indexes
            .push((loop_name.map(|s| s.to_string()), index));
        self
    }
}

impl ExpressionHost for StaticHost {
    fn parameter(&mut self, name: &str) -> ExprResult<Value> {
        self.parameters
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownParameter {
                name: name.to_string(),
            })
    }

    fn variable(&mut self, name: &str) -> ExprResult<Value> {
        self.variables
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownVariable {
                name: name.to_string(),
            })
    }

    fn copy_index(&self, loop_name: Option<&str>) -> ExprResult<i64> {
        let found = match loop_name {
            None => self.copy_indexes.last(),
            Some(name) => self.copy_indexes.iter().rev().find(|(n, _)| {
                n.as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name))
            }),
        };
        found
            .map(|(_, i)| *i)
            .ok_or_else(|| ExpressionError::CopyIndexUnavailable {
                loop_name: loop_name.map(|s| s.to_string()),
            })
    }

    fn deployment(&self) -> Value {
        json!({ "name": "deployment", "properties": { "template": {}, "parameters": {} } })
    }

    fn subscription(&self) -> Value {
        let id = "00000000-0000-0000-0000-000000000000";
        json!({
            "id": format!("/subscriptions/{}", id),
            "subscriptionId": id,
            "tenantId": id,
            "displayName": "Static subscription"
        })
    }

    fn resource_group(&self) -> Value {
        json!({
            "id": "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/static-rg",
            "name": "static-rg",
            "type": "Microsoft.Resources/resourceGroups",
            "location": "eastus",
            "properties": { "provisioningState": "Succeeded" }
        })
    }

    fn tenant(&self) -> Value {
        json!({ "tenantId": "00000000-0000-0000-0000-000000000000" })
    }

    fn utc_now(&self) -> DateTime<Utc> {
        self.now
    }

    fn new_guid(&mut self) -> Uuid {
        self.guid_counter += 1;
        Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            format!("static-host/{}", self.guid_counter).as_bytes(),
        )
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}
