//! Expansion Diagnostics
//!
//! Non-fatal findings raised while expanding a deployment: unknown functions
//! in untaken branches, references to resources outside the template, linked
//! templates that could not be loaded. Fatal problems are `ExpandError`s.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Diagnostic severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Diagnostic codes for categorizing issues
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // =========================================================================
    // Expression warnings
    // =========================================================================
    /// Raised by the evaluator, e.g. an unknown function in an untaken `if` branch
    ExpressionWarning,

    // =========================================================================
    // Reference warnings
    // =========================================================================
    ExternalReference,
    UnknownParameterValue,
    UnmatchedDependency,

    // =========================================================================
    // Nested deployment warnings
    // =========================================================================
    LinkedTemplateUnavailable,

    // =========================================================================
    // Failures (mirrors of ExpandError, reported per resource/output)
    // =========================================================================
    ResourceFailed,
    OutputFailed,
}

/// Where in the template a diagnostic points
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateLocation {
    /// Deployment name the template was expanded under
    pub deployment: String,
    /// JSON pointer into the template, e.g. `/resources/2/properties/name`
    pub pointer: String,
}

impl TemplateLocation {
    pub fn new(deployment: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            pointer: pointer.into(),
        }
    }
}

/// A diagnostic message with severity and optional location
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub location: Option<TemplateLocation>,
}

impl Diagnostic {
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn warning(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn info(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            code,
            message: message.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: TemplateLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives diagnostics as they are raised
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        let pointer = diagnostic
            .location
            .as_ref()
            .map(|l| format!("{}{}", l.deployment, l.pointer))
            .unwrap_or_default();
        match diagnostic.severity {
            Severity::Error => {
                tracing::error!(code = ?diagnostic.code, at = %pointer, "{}", diagnostic.message)
            }
            Severity::Warning => {
                tracing::warn!(code = ?diagnostic.code, at = %pointer, "{}", diagnostic.message)
            }
            Severity::Info => {
                tracing::info!(code = ?diagnostic.code, at = %pointer, "{}", diagnostic.message)
            }
        }
    }
}

/// Keeps every diagnostic for later inspection
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.items
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        if let Ok(mut items) = self.items.lock() {
            items.push(diagnostic.clone());
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn external_reference_warning(target: &str) -> Diagnostic {
    Diagnostic::warning(
        DiagnosticCode::ExternalReference,
        format!(
            "'{}' is not declared in this template; reference() returns a placeholder",
            target
        ),
    )
}

pub fn unmatched_dependency_warning(resource: &str, dependency: &str) -> Diagnostic {
    Diagnostic::warning(
        DiagnosticCode::UnmatchedDependency,
        format!(
            "Resource '{}' depends on '{}' which is not declared in this template",
            resource, dependency
        ),
    )
}

pub fn linked_template_warning(deployment: &str, reason: &str) -> Diagnostic {
    Diagnostic::warning(
        DiagnosticCode::LinkedTemplateUnavailable,
        format!(
            "Linked template for deployment '{}' was not expanded: {}",
            deployment, reason
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_location() {
        let d = Diagnostic::warning(DiagnosticCode::ExpressionWarning, "odd")
            .with_location(TemplateLocation::new("main", "/resources/0"));
        assert!(d.is_warning());
        assert!(!d.is_error());
        assert_eq!(d.location.unwrap().pointer, "/resources/0");
    }

    #[test]
    fn test_collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.report(&external_reference_warning("a"));
        sink.report(&unmatched_dependency_warning("b", "c"));
        let items = sink.diagnostics();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].code, DiagnosticCode::ExternalReference);
        assert_eq!(items[1].code, DiagnosticCode::UnmatchedDependency);
    }
}
