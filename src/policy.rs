//! Policy Definition Classifier
//!
//! Tags policy and policy set definitions among expanded resources, and keeps
//! the index of definitions already covered by known rules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ExpandError, Result};

pub const POLICY_DEFINITION_TYPE: &str = "Microsoft.Authorization/policyDefinitions";
pub const POLICY_SET_DEFINITION_TYPE: &str = "Microsoft.Authorization/policySetDefinitions";

static BUILTIN_POLICY_IGNORE: &str = include_str!("../data/policy-ignore.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PolicyDefinitionKind {
    #[default]
    Unknown,
    PolicyDefinition,
    PolicySetDefinition,
}

/// Classify a resource type; anything but the two policy types is `Unknown`
pub fn classify(resource_type: &str) -> PolicyDefinitionKind {
    if resource_type.eq_ignore_ascii_case(POLICY_DEFINITION_TYPE) {
        PolicyDefinitionKind::PolicyDefinition
    } else if resource_type.eq_ignore_ascii_case(POLICY_SET_DEFINITION_TYPE) {
        PolicyDefinitionKind::PolicySetDefinition
    } else {
        PolicyDefinitionKind::Unknown
    }
}

/// Why a policy definition is ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PolicyIgnoreReason {
    /// Duplicated by an existing rule
    Duplicate = 1,
    /// Not testable from infrastructure code
    NotApplicable = 2,
    /// Excluded by the caller
    Configured = 3,
}

impl TryFrom<u8> for PolicyIgnoreReason {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PolicyIgnoreReason::Duplicate),
            2 => Ok(PolicyIgnoreReason::NotApplicable),
            3 => Ok(PolicyIgnoreReason::Configured),
            other => Err(format!("unknown policy ignore reason {}", other)),
        }
    }
}

impl From<PolicyIgnoreReason> for u8 {
    fn from(reason: PolicyIgnoreReason) -> Self {
        reason as u8
    }
}

/// One entry of the serialized index
#[derive(Debug, Clone, Deserialize)]
struct PolicyIgnoreEntry {
    #[serde(rename = "i")]
    definition_ids: Vec<String>,
    #[serde(rename = "r")]
    reason: PolicyIgnoreReason,
    #[serde(rename = "v", default)]
    value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyIgnoreResult {
    pub reason: PolicyIgnoreReason,
    /// Rule names covering the definition
    pub values: Vec<String>,
}

/// Definition id (case-insensitive) → ignore result
#[derive(Debug, Clone, Default)]
pub struct PolicyIgnoreIndex {
    entries: HashMap<String, PolicyIgnoreResult>,
}

impl PolicyIgnoreIndex {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_POLICY_IGNORE)
    }

    /// Parse `[{"i": [ids], "r": reason, "v": value?}]`, merging repeated ids.
    /// The first entry naming an id decides its reason.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<PolicyIgnoreEntry> = serde_json::from_str(json).map_err(|e| {
            ExpandError::malformed("", format!("invalid policy ignore data: {}", e))
        })?;
        let mut index = Self::default();
        for entry in entries {
            for id in entry.definition_ids {
                let result = index
                    .entries
                    .entry(id.to_ascii_lowercase())
                    .or_insert_with(|| PolicyIgnoreResult {
                        reason: entry.reason,
                        values: Vec::new(),
                    });
                if let Some(value) = &entry.value {
                    result.values.push(value.clone());
                }
            }
        }
        Ok(index)
    }

    /// Add caller exclusions; existing entries keep their reason
    pub fn with_configured<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            self.entries
                .entry(id.as_ref().to_ascii_lowercase())
                .or_insert_with(|| PolicyIgnoreResult {
                    reason: PolicyIgnoreReason::Configured,
                    values: Vec::new(),
                });
        }
        self
    }

    pub fn get(&self, definition_id: &str) -> Option<&PolicyIgnoreResult> {
        self.entries.get(&definition_id.to_ascii_lowercase())
    }

    pub fn is_ignored(&self, definition_id: &str) -> bool {
        self.get(definition_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
