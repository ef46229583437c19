//! Nested and linked deployments
//!
//! These tests verify:
//! 1. Child outputs reach the parent through `reference(...).outputs`
//! 2. Child resources are emitted after their deployment resource
//! 3. Linked templates load through the configured loader, and are left
//!    unexpanded with a warning when they cannot be loaded

mod common;

use std::sync::Arc;

use arm_expand::{
    DiagnosticCode, ErrorKind, FileSystemLoader, InMemoryLoader, Template,
};
use common::{collecting_expander, expand_fixture, expander, fixture, fixtures_dir, names, template};
use pretty_assertions::assert_eq;
use serde_json::json;

const RG: &str = "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/ps-rule-test-rg";

#[test]
fn test_inline_nested_outputs_propagate() {
    let deployment = expand_fixture("nested.json", json!({}));
    assert!(deployment.is_complete(), "{:?}", deployment.failures);
    assert_eq!(names(&deployment), vec!["storage-module", "contosodata", "app"]);

    let module = &deployment.resources[0];
    assert_eq!(
        module.id,
        format!("{}/providers/Microsoft.Resources/deployments/storage-module", RG)
    );
    assert_eq!(
        module.properties()["outputs"]["accountName"],
        json!({ "type": "String", "value": "contosodata" })
    );
    assert!(module.properties()["template"]["resources"].is_array());

    let account = &deployment.resources[1];
    assert_eq!(account.deployment, "storage-module");
    assert_eq!(account.body()["location"], json!("eastus"));

    let app = &deployment.resources[2];
    assert_eq!(app.depends_on, vec![module.id.clone()]);
    assert_eq!(app.properties()["storageAccount"], json!("contosodata"));
    assert_eq!(deployment.try_output("accountId"), Some(&json!(account.id)));
}

#[test]
fn test_nested_scope_does_not_see_parent_variables() {
    let deployment = common::expand_value(json!({
        "variables": { "secretName": "parent-only" },
        "resources": [{
            "type": "Microsoft.Resources/deployments",
            "apiVersion": "2022-09-01",
            "name": "child",
            "properties": {
                "mode": "Incremental",
                "template": {
                    "resources": [{
                        "type": "Microsoft.Storage/storageAccounts",
                        "apiVersion": "2023-01-01",
                        "name": "[variables('secretName')]"
                    }]
                }
            }
        }]
    }));
    assert_eq!(names(&deployment), vec!["child"]);
    assert_eq!(deployment.failures.len(), 1);
    assert_eq!(deployment.failures[0].deployment, "child");
    assert_eq!(deployment.failures[0].kind(), ErrorKind::MalformedTemplate);
}

#[test]
fn test_nested_resource_group_override() {
    let deployment = common::expand_value(json!({
        "resources": [{
            "type": "Microsoft.Resources/deployments",
            "apiVersion": "2022-09-01",
            "name": "shared",
            "resourceGroup": "shared-rg",
            "properties": {
                "mode": "Incremental",
                "template": {
                    "resources": [{
                        "type": "Microsoft.Network/privateDnsZones",
                        "apiVersion": "2020-06-01",
                        "name": "privatelink.blob.core.windows.net",
                        "location": "global",
                        "properties": { "group": "[resourceGroup().name]" }
                    }]
                }
            }
        }]
    }));
    assert_eq!(
        deployment.resources[0].id,
        "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/shared-rg/providers/Microsoft.Resources/deployments/shared"
    );
    let zone = &deployment.resources[1];
    assert_eq!(
        zone.id,
        "/subscriptions/ffffffff-ffff-ffff-ffff-ffffffffffff/resourceGroups/shared-rg/providers/Microsoft.Network/privateDnsZones/privatelink.blob.core.windows.net"
    );
    assert_eq!(zone.properties()["group"], json!("shared-rg"));
}

#[test]
fn test_linked_template_from_file_system() {
    let expander = expander().with_loader(Arc::new(FileSystemLoader::new(fixtures_dir())));
    let deployment = expander
        .expand(&template("linked.json"), Default::default())
        .unwrap();
    assert!(deployment.is_complete(), "{:?}", deployment.failures);
    assert_eq!(names(&deployment), vec!["network", "vnet-hub"]);
    assert_eq!(
        deployment.output::<String>("vnetId"),
        Some(format!(
            "{}/providers/Microsoft.Network/virtualNetworks/vnet-hub",
            RG
        ))
    );
}

#[test]
fn test_linked_template_from_memory() {
    let loader = InMemoryLoader::new()
        .with_template("modules/network.json", fixture("modules/network.json"));
    let deployment = expander()
        .with_loader(Arc::new(loader))
        .expand(&template("linked.json"), Default::default())
        .unwrap();
    assert_eq!(names(&deployment), vec!["network", "vnet-hub"]);
    assert_eq!(deployment.resources[1].deployment, "network");
}

#[test]
fn test_unavailable_linked_template_warns() {
    let (expander, sink) = collecting_expander();
    let deployment = expander
        .expand(&template("linked.json"), Default::default())
        .unwrap();
    assert_eq!(names(&deployment), vec!["network"]);

    let warnings: Vec<_> = sink
        .diagnostics()
        .into_iter()
        .filter(|d| d.code == DiagnosticCode::LinkedTemplateUnavailable)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].location.as_ref().map(|l| l.pointer.as_str()),
        Some("/resources/0/properties/templateLink")
    );
    assert!(deployment
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::LinkedTemplateUnavailable));
}

#[test]
fn test_independent_trees_expand_in_parallel() {
    let expander = expander();
    let nested = template("nested.json");
    let storage = Template::parse(&fixture("storage.json")).unwrap();

    let (a, b) = std::thread::scope(|s| {
        let a = s.spawn(|| expander.expand(&nested, Default::default()));
        let b = s.spawn(|| expander.expand(&storage, Default::default()));
        (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
    });
    assert_eq!(a.resources.len(), 3);
    assert_eq!(b.resources.len(), 2);
}
