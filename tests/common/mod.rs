//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Once};

use arm_expand::{CollectingSink, ExpandedDeployment, Expander, ExpansionOptions, Template};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG=arm_expand=debug` shows passes
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

pub fn fixture(name: &str) -> String {
    let path = fixtures_dir().join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}

pub fn template(name: &str) -> Template {
    Template::parse(&fixture(name)).expect("fixture template should parse")
}

pub fn expander() -> Expander {
    init_tracing();
    Expander::new(ExpansionOptions::default()).expect("default options are valid")
}

/// Expander reporting into a sink the test can inspect
pub fn collecting_expander() -> (Expander, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    (expander().with_sink(sink.clone()), sink)
}

pub fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn expand_fixture(name: &str, parameters: Value) -> ExpandedDeployment {
    expander()
        .expand(&template(name), params(parameters))
        .expect("fixture should expand")
}

pub fn expand_value(template: Value) -> ExpandedDeployment {
    expander()
        .expand(
            &Template::from_value(&template).expect("template should parse"),
            Map::new(),
        )
        .expect("template should expand")
}

pub fn names(deployment: &ExpandedDeployment) -> Vec<&str> {
    deployment.resources.iter().map(|r| r.name.as_str()).collect()
}
