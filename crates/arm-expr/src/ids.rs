//! Resource identifier construction
//!
//! ARM ids interleave the resource type segments with the name segments:
//! `Microsoft.Network/virtualNetworks/subnets` named `vnet/default` becomes
//! `providers/Microsoft.Network/virtualNetworks/vnet/subnets/default`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ExpressionError;

pub const RESOURCE_GROUP_TYPE: &str = "Microsoft.Resources/resourceGroups";
pub const DEPLOYMENT_TYPE: &str = "Microsoft.Resources/deployments";
pub const MANAGEMENT_GROUP_TYPE: &str = "Microsoft.Management/managementGroups";

/// Level a deployment targets, taken from the template `$schema`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeLevel {
    Tenant,
    ManagementGroup,
    Subscription,
    #[default]
    ResourceGroup,
}

impl ScopeLevel {
    /// Derive the level from a template `$schema` URI
    pub fn from_schema(schema: &str) -> Self {
        let schema = schema.to_ascii_lowercase();
        if schema.contains("/subscriptiondeploymenttemplate.json") {
            ScopeLevel::Subscription
        } else if schema.contains("/managementgroupdeploymenttemplate.json") {
            ScopeLevel::ManagementGroup
        } else if schema.contains("/tenantdeploymenttemplate.json") {
            ScopeLevel::Tenant
        } else {
            ScopeLevel::ResourceGroup
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceIdError {
    #[error("resource type '{0}' must be in the form '<namespace>/<type>'")]
    InvalidType(String),

    #[error("resource type '{resource_type}' needs {expected} name segment(s), got {actual}")]
    NameCountMismatch {
        resource_type: String,
        expected: usize,
        actual: usize,
    },
}

impl ResourceIdError {
    pub fn into_expression_error(self, function: &str) -> ExpressionError {
        ExpressionError::invalid_argument(function, self.to_string())
    }
}

/// Split `Namespace/type/child` into the namespace and the type segments
pub fn split_type(resource_type: &str) -> Result<(&str, Vec<&str>), ResourceIdError> {
    let mut parts = resource_type.split('/');
    let namespace = parts.next().filter(|s| !s.is_empty());
    let types: Vec<&str> = parts.collect();
    match namespace {
        Some(ns) if !types.is_empty() && types.iter().all(|t| !t.is_empty()) => Ok((ns, types)),
        _ => Err(ResourceIdError::InvalidType(resource_type.to_string())),
    }
}

/// Split a resource name into its `/`-separated segments
pub fn split_name(name: &str) -> Vec<&str> {
    name.split('/').collect()
}

/// `providers/{namespace}/{type0}/{name0}/{type1}/{name1}...`
pub fn provider_path(resource_type: &str, names: &[&str]) -> Result<String, ResourceIdError> {
    let (namespace, types) = split_type(resource_type)?;
    if types.len() != names.len() {
        return Err(ResourceIdError::NameCountMismatch {
            resource_type: resource_type.to_string(),
            expected: types.len(),
            actual: names.len(),
        });
    }

    let mut path = format!("providers/{}", namespace);
    for (t, n) in types.iter().zip(names) {
        path.push('/');
        path.push_str(t);
        path.push('/');
        path.push_str(n);
    }
    Ok(path)
}

pub fn subscription_scope(subscription_id: &str) -> String {
    format!("/subscriptions/{}", subscription_id)
}

pub fn resource_group_scope(subscription_id: &str, resource_group: &str) -> String {
    format!(
        "/subscriptions/{}/resourceGroups/{}",
        subscription_id, resource_group
    )
}

pub fn management_group_scope(management_group: &str) -> String {
    format!("/providers/{}/{}", MANAGEMENT_GROUP_TYPE, management_group)
}

/// Build an id for `resource_type` / `names` under an existing scope id.
///
/// An empty scope or `/` is the tenant root. Resource groups under a
/// subscription use the short `resourceGroups/{name}` form.
pub fn scoped_resource_id(
    scope: &str,
    resource_type: &str,
    names: &[&str],
) -> Result<String, ResourceIdError> {
    let scope = scope.trim_end_matches('/');
    if resource_type.eq_ignore_ascii_case(RESOURCE_GROUP_TYPE) {
        if names.len() != 1 {
            return Err(ResourceIdError::NameCountMismatch {
                resource_type: resource_type.to_string(),
                expected: 1,
                actual: names.len(),
            });
        }
        return Ok(format!("{}/resourceGroups/{}", scope, names[0]));
    }
    Ok(format!("{}/{}", scope, provider_path(resource_type, names)?))
}

/// Case-insensitive id comparison
pub fn ids_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}
