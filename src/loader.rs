//! Linked templates and parameter files
//!
//! Linked deployments name their template by URI or relative path. The
//! expander never fetches anything itself: it asks a [`TemplateLoader`] for
//! the already-available text.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

use crate::secrets::secret_reference_placeholder;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoaderError {
    #[error("Template '{reference}' was not found")]
    NotFound { reference: String },

    #[error("Template '{reference}' cannot be loaded: {message}")]
    Unsupported { reference: String, message: String },

    #[error("Failed to read '{reference}': {message}")]
    Io { reference: String, message: String },
}

/// Resolves a linked template reference to raw JSON text
pub trait TemplateLoader: Send + Sync {
    fn load(&self, reference: &str) -> Result<String, LoaderError>;
}

/// Serves templates registered in memory, keyed by reference
#[derive(Debug, Default, Clone)]
pub struct InMemoryLoader {
    templates: HashMap<String, String>,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, reference: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(reference.into(), text.into());
        self
    }
}

impl TemplateLoader for InMemoryLoader {
    fn load(&self, reference: &str) -> Result<String, LoaderError> {
        self.templates
            .get(reference)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound {
                reference: reference.to_string(),
            })
    }
}

/// Reads relative paths and `file://` URLs below a root directory
#[derive(Debug, Clone)]
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, LoaderError> {
        if let Ok(url) = Url::parse(reference) {
            return match url.scheme() {
                "file" => url.to_file_path().map_err(|_| LoaderError::Unsupported {
                    reference: reference.to_string(),
                    message: "not a local file path".into(),
                }),
                scheme => Err(LoaderError::Unsupported {
                    reference: reference.to_string(),
                    message: format!("'{}' links are not fetched", scheme),
                }),
            };
        }
        let path = Path::new(reference);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        })
    }
}

impl TemplateLoader for FileSystemLoader {
    fn load(&self, reference: &str) -> Result<String, LoaderError> {
        let path = self.resolve(reference)?;
        if !path.is_file() {
            return Err(LoaderError::NotFound {
                reference: reference.to_string(),
            });
        }
        std::fs::read_to_string(&path).map_err(|e| LoaderError::Io {
            reference: reference.to_string(),
            message: e.to_string(),
        })
    }
}

/// Turn one `parameters` entry of a deployment or parameter file into a value.
///
/// `{"value": v}` yields `v`; a Key Vault `reference`, either
/// `{"secretName": s}` or a bare string `s`, yields a
/// `{{SecretReference:s}}` placeholder.
pub fn parameter_value(entry: &Value) -> Option<Value> {
    let entry = entry.as_object()?;
    if let Some(value) = arm_expr::value::get_property(entry, "value") {
        return Some(value.clone());
    }
    let secret = match arm_expr::value::get_property(entry, "reference")? {
        Value::String(name) => name.as_str(),
        Value::Object(reference) => {
            arm_expr::value::get_property(reference, "secretName")?.as_str()?
        }
        _ => return None,
    };
    Some(Value::String(secret_reference_placeholder(secret)))
}

/// Caller values from a parameter file document
/// (`{"parameters": {"name": {"value": ...}}}`)
pub fn parse_parameter_file(text: &str) -> anyhow::Result<Map<String, Value>> {
    let document: Value = serde_json::from_str(text).context("Failed to parse parameter file")?;
    let parameters = document
        .get("parameters")
        .and_then(Value::as_object)
        .context("Parameter file has no 'parameters' object")?;

    let mut values = Map::new();
    for (name, entry) in parameters {
        let value = parameter_value(entry)
            .with_context(|| format!("Parameter '{}' has neither 'value' nor 'reference'", name))?;
        values.insert(name.clone(), value);
    }
    Ok(values)
}

pub fn load_parameter_file(path: impl AsRef<Path>) -> anyhow::Result<Map<String, Value>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_parameter_file(&text).with_context(|| format!("Invalid parameter file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_in_memory_loader() {
        let loader = InMemoryLoader::new().with_template("child.json", "{}");
        assert_eq!(loader.load("child.json").unwrap(), "{}");
        assert!(matches!(
            loader.load("other.json"),
            Err(LoaderError::NotFound { .. })
        ));
    }

    #[test]
    fn test_file_system_loader_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("modules")).unwrap();
        std::fs::write(dir.path().join("modules/child.json"), r#"{"resources": []}"#).unwrap();

        let loader = FileSystemLoader::new(dir.path());
        assert_eq!(loader.load("modules/child.json").unwrap(), r#"{"resources": []}"#);
        assert!(matches!(
            loader.load("modules/missing.json"),
            Err(LoaderError::NotFound { .. })
        ));
    }

    #[test]
    fn test_http_links_are_not_fetched() {
        let loader = FileSystemLoader::new(".");
        assert!(matches!(
            loader.load("https://example.com/template.json"),
            Err(LoaderError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_parameter_file() {
        let values = parse_parameter_file(
            r#"{
                "$schema": "https://schema.management.azure.com/schemas/2019-04-01/deploymentParameters.json#",
                "parameters": {
                    "name": { "value": "app" },
                    "password": {
                        "reference": {
                            "keyVault": { "id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/kv" },
                            "secretName": "admin-password"
                        }
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(values["name"], json!("app"));
        assert_eq!(values["password"], json!("{{SecretReference:admin-password}}"));
    }

    #[test]
    fn test_parameter_file_string_reference() {
        let values = parse_parameter_file(
            r#"{"parameters": {"adminPassword": {"reference": "vm-admin"}, "size": {"value": 2}}}"#,
        )
        .unwrap();
        assert_eq!(values["adminPassword"], json!("{{SecretReference:vm-admin}}"));
        assert_eq!(values["size"], json!(2));
        assert_eq!(parameter_value(&json!({ "reference": 7 })), None);
    }

    #[test]
    fn test_parameter_file_rejects_bare_values() {
        let err = parse_parameter_file(r#"{"parameters": {"x": 1}}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("'x'"));
    }
}
