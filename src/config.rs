//! Expansion options
//!
//! Everything the expander needs to know about the target environment that a
//! template cannot tell it: the deployment name, subscription, resource group,
//! tenant, the clock, and limits. Loaded from YAML or built in code.
//!
//! ```yaml
//! deploymentName: my-deployment
//! subscription:
//!   subscriptionId: 00000000-0000-0000-0000-000000000001
//! resourceGroup:
//!   name: rg-app
//!   location: westeurope
//! keepSecretProperties: false
//! utcNow: 2024-01-01T00:00:00Z
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Environment variable naming an options file for [`ExpansionOptions::from_env`]
pub const CONFIG_ENV_VAR: &str = "ARM_EXPAND_CONFIG";

pub const DEFAULT_DEPLOYMENT_NAME: &str = "ps-rule-test-deployment";
pub const DEFAULT_SUBSCRIPTION_ID: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";
pub const DEFAULT_TENANT_ID: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";
pub const DEFAULT_RESOURCE_GROUP: &str = "ps-rule-test-rg";
pub const DEFAULT_LOCATION: &str = "eastus";
pub const DEFAULT_MANAGEMENT_GROUP: &str = "psrule-test";
pub const DEFAULT_MAX_COPY_COUNT: usize = 800;
pub const DEFAULT_MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionOptions {
    pub subscription_id: String,
    pub tenant_id: String,
    pub display_name: String,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            subscription_id: DEFAULT_SUBSCRIPTION_ID.to_string(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            display_name: "PSRule Test Subscription".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceGroupOptions {
    pub name: String,
    pub location: String,
    /// `managedBy` on `resourceGroup()`
    pub managed_by: Option<String>,
    pub tags: serde_json::Map<String, serde_json::Value>,
}

impl Default for ResourceGroupOptions {
    fn default() -> Self {
        Self {
            name: DEFAULT_RESOURCE_GROUP.to_string(),
            location: DEFAULT_LOCATION.to_string(),
            managed_by: None,
            tags: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpansionOptions {
    pub deployment_name: String,
    pub subscription: SubscriptionOptions,
    pub resource_group: ResourceGroupOptions,
    pub tenant_id: String,
    pub management_group: String,
    /// Leave literal values at registered secret paths untouched
    pub keep_secret_properties: bool,
    /// Value returned by `utcNow()`
    pub utc_now: DateTime<Utc>,
    pub max_copy_count: usize,
    /// Nesting limit for nested and linked deployments
    pub max_depth: usize,
    /// Policy definition ids to ignore in addition to the built-in list
    pub policy_ignore: Vec<String>,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        Self {
            deployment_name: DEFAULT_DEPLOYMENT_NAME.to_string(),
            subscription: SubscriptionOptions::default(),
            resource_group: ResourceGroupOptions::default(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            management_group: DEFAULT_MANAGEMENT_GROUP.to_string(),
            keep_secret_properties: false,
            utc_now: Utc
                .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
            max_copy_count: DEFAULT_MAX_COPY_COUNT,
            max_depth: DEFAULT_MAX_DEPTH,
            policy_ignore: Vec::new(),
        }
    }
}

impl ExpansionOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let options: ExpansionOptions =
            serde_yaml::from_str(yaml).context("Failed to parse expansion options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let options: ExpansionOptions = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        options
            .validate()
            .with_context(|| format!("Invalid options in {}", path.display()))?;
        info!("Loaded expansion options from {}", path.display());
        Ok(options)
    }

    /// Load from the file named by `ARM_EXPAND_CONFIG`, or defaults when unset
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.deployment_name.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "deploymentName",
            });
        }
        if self.subscription.subscription_id.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "subscription.subscriptionId",
            });
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Zero { field: "maxDepth" });
        }
        Ok(())
    }

    pub fn with_deployment_name(mut self, name: impl Into<String>) -> Self {
        self.deployment_name = name.into();
        self
    }

    pub fn with_keep_secret_properties(mut self, keep: bool) -> Self {
        self.keep_secret_properties = keep;
        self
    }

    pub fn with_resource_group(mut self, name: impl Into<String>) -> Self {
        self.resource_group.name = name.into();
        self
    }

    pub fn with_subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription.subscription_id = id.into();
        self
    }

    pub fn with_utc_now(mut self, now: DateTime<Utc>) -> Self {
        self.utc_now = now;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let options = ExpansionOptions::default();
        assert_eq!(options.deployment_name, "ps-rule-test-deployment");
        assert_eq!(options.resource_group.name, "ps-rule-test-rg");
        assert_eq!(options.resource_group.location, "eastus");
        assert_eq!(options.max_copy_count, 800);
        assert!(!options.keep_secret_properties);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let options = ExpansionOptions::from_yaml_str(
            "deploymentName: app\nresourceGroup:\n  name: rg-app\nkeepSecretProperties: true\n",
        )
        .unwrap();
        assert_eq!(options.deployment_name, "app");
        assert_eq!(options.resource_group.name, "rg-app");
        assert_eq!(options.resource_group.location, "eastus");
        assert!(options.keep_secret_properties);
        assert_eq!(options.subscription.subscription_id, DEFAULT_SUBSCRIPTION_ID);
    }

    #[test]
    fn test_validation_rejects_zero_depth() {
        let err = ExpansionOptions::from_yaml_str("maxDepth: 0\n").unwrap_err();
        assert!(format!("{:#}", err).contains("maxDepth"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "deploymentName: from-file\nutcNow: 2024-05-01T12:00:00Z").unwrap();
        let options = ExpansionOptions::from_file(file.path()).unwrap();
        assert_eq!(options.deployment_name, "from-file");
        assert_eq!(options.utc_now.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = ExpansionOptions::from_file("/does/not/exist.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
