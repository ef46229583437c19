//! ARM template expansion
//!
//! Turns an Azure Resource Manager template plus parameter values into the
//! concrete resources a deployment would create, without contacting Azure.
//!
//! Pipeline:
//! Template JSON -> [`Template`] -> [`DeploymentContext`] (symbols, ordering,
//! passes) -> [`ExpandedDeployment`] (resources, outputs, failures)
//!
//! Expressions are parsed and evaluated by the `arm-expr` crate, which sees
//! deployment state only through the `ExpressionHost` implemented by
//! [`DeploymentScope`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arm_expand::{ExpansionOptions, Expander};
//!
//! let expander = Expander::new(ExpansionOptions::default()).unwrap();
//! let template = r#"{
//!     "resources": [{
//!         "type": "Microsoft.Storage/storageAccounts",
//!         "apiVersion": "2023-01-01",
//!         "name": "[concat('sa', uniqueString(resourceGroup().id))]"
//!     }]
//! }"#;
//! let deployment = expander.expand_str(template, None).unwrap();
//! assert_eq!(deployment.resources.len(), 1);
//! ```

// Errors and diagnostics
pub mod diagnostics;
pub mod error;

// Configuration
pub mod config;

// Template model and linked template loading
pub mod loader;
pub mod template;

// Expansion state
pub mod dag;
pub mod resource;
pub mod scope;
pub mod symbols;

// Post-processing of expanded resources
pub mod policy;
pub mod secrets;

// Orchestration
pub mod deployment;

pub use arm_expr;

pub use config::{ExpansionOptions, ResourceGroupOptions, SubscriptionOptions};
pub use deployment::{DeploymentContext, ExpandedDeployment, Expander};
pub use diagnostics::{
    CollectingSink, Diagnostic, DiagnosticCode, DiagnosticSink, Severity, TemplateLocation,
    TracingSink,
};
pub use error::{ErrorKind, ExpandError, ExpansionFailure, FailureSubject, Result};
pub use loader::{FileSystemLoader, InMemoryLoader, LoaderError, TemplateLoader};
pub use policy::{PolicyDefinitionKind, PolicyIgnoreIndex, PolicyIgnoreReason};
pub use resource::{ResourceIdentity, ResourceValue};
pub use scope::{DeploymentIdentity, DeploymentScope};
pub use secrets::{SecretPropertyRegistry, SECRET_PLACEHOLDER};
pub use symbols::{DeploymentSymbol, SymbolKind, SymbolTable};
pub use template::Template;
