//! Resource functions
//!
//! Id construction follows the deployment's scope level: a bare
//! `resourceId(type, name)` resolves against the current resource group,
//! subscription or tenant root.

use serde_json::Value;

use super::{Args, Dispatch, Registry};
use crate::error::{ExprResult, ExpressionError};
use crate::host::ExpressionHost;
use crate::ids::{self, ScopeLevel, RESOURCE_GROUP_TYPE};
use crate::value::{mock, MOCK_SECRET_LIST};

pub(super) fn register(r: &mut Registry) {
    r.insert("extensionresourceid", Dispatch::Eager(extension_resource_id));
    r.insert("reference", Dispatch::Eager(reference));
    r.insert("resourcegroup", Dispatch::Eager(resource_group));
    r.insert("resourceid", Dispatch::Eager(resource_id));
    r.insert("resourceinfo", Dispatch::Eager(resource_info));
    r.insert("subscription", Dispatch::Eager(subscription));
    r.insert("subscriptionresourceid", Dispatch::Eager(subscription_resource_id));
    r.insert("tenant", Dispatch::Eager(tenant));
    r.insert("tenantresourceid", Dispatch::Eager(tenant_resource_id));
}

/// `list{Value}(resourceNameOrId, apiVersion, [functionValues])`
///
/// Listed values only exist at deployment time, so the result is a
/// placeholder that accepts any property or index.
pub(super) fn list(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, Some(3))?;
    args.string(0)?;
    Ok(mock(MOCK_SECRET_LIST))
}

fn current_subscription_id(host: &dyn ExpressionHost) -> String {
    host.subscription()
        .get("subscriptionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn current_resource_group(host: &dyn ExpressionHost) -> String {
    host.resource_group()
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn string_args<'a>(args: &'a Args<'_>) -> ExprResult<Vec<&'a str>> {
    (0..args.len()).map(|i| args.string(i)).collect()
}

/// Position of the resource type among the first `max_leading + 1` arguments
fn type_position(args: &Args<'_>, strings: &[&str], max_leading: usize) -> ExprResult<usize> {
    strings
        .iter()
        .take(max_leading + 1)
        .position(|s| s.contains('/'))
        .ok_or_else(|| {
            ExpressionError::invalid_argument(args.function(), "no resource type argument found")
        })
}

fn names_after<'a>(strings: &[&'a str], type_pos: usize) -> Vec<&'a str> {
    strings[type_pos + 1..]
        .iter()
        .flat_map(|n| ids::split_name(n))
        .collect()
}

fn build(function: &str, scope: &str, resource_type: &str, names: &[&str]) -> ExprResult<Value> {
    ids::scoped_resource_id(scope, resource_type, names)
        .map(Value::String)
        .map_err(|e| e.into_expression_error(function))
}

/// `resourceId([subscriptionId], [resourceGroupName], resourceType, name...)`
fn resource_id(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, None)?;
    let strings = string_args(args)?;
    let type_pos = type_position(args, &strings, 2)?;
    let resource_type = strings[type_pos];
    let names = names_after(&strings, type_pos);

    let subscription_id = match type_pos {
        2 => strings[0].to_string(),
        _ => current_subscription_id(host),
    };

    let scope = if resource_type.eq_ignore_ascii_case(RESOURCE_GROUP_TYPE) {
        ids::subscription_scope(&subscription_id)
    } else {
        match (type_pos, host.scope_level()) {
            (2, _) => ids::resource_group_scope(strings[0], strings[1]),
            (1, _) => ids::resource_group_scope(&subscription_id, strings[0]),
            (_, ScopeLevel::ResourceGroup) => {
                ids::resource_group_scope(&subscription_id, &current_resource_group(host))
            }
            (_, ScopeLevel::Subscription) => ids::subscription_scope(&subscription_id),
            (_, ScopeLevel::ManagementGroup) | (_, ScopeLevel::Tenant) => String::from("/"),
        }
    };
    build("resourceId", &scope, resource_type, &names)
}

/// `subscriptionResourceId([subscriptionId], resourceType, name...)`
fn subscription_resource_id(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, None)?;
    let strings = string_args(args)?;
    let type_pos = type_position(args, &strings, 1)?;
    let subscription_id = match type_pos {
        1 => strings[0].to_string(),
        _ => current_subscription_id(host),
    };
    let names = names_after(&strings, type_pos);
    build(
        "subscriptionResourceId",
        &ids::subscription_scope(&subscription_id),
        strings[type_pos],
        &names,
    )
}

/// `tenantResourceId(resourceType, name...)`
fn tenant_resource_id(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(2, None)?;
    let strings = string_args(args)?;
    let names = names_after(&strings, 0);
    build("tenantResourceId", "/", strings[0], &names)
}

/// `extensionResourceId(resourceId, resourceType, name...)`
fn extension_resource_id(_: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(3, None)?;
    let strings = string_args(args)?;
    let names = names_after(&strings, 1);
    build("extensionResourceId", strings[0], strings[1], &names)
}

/// `reference(resourceNameOrId, [apiVersion], ['Full'])`
fn reference(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.expect(1, Some(3))?;
    let target = args.string(0)?;
    let full = match args.get(2) {
        Some(Value::String(s)) => s.eq_ignore_ascii_case("full"),
        _ => false,
    };
    host.reference(target, full)
}

fn resource_info(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(1)?;
    host.resource_info(args.string(0)?)
}

fn resource_group(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(host.resource_group())
}

fn subscription(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(host.subscription())
}

fn tenant(host: &mut dyn ExpressionHost, args: &Args<'_>) -> ExprResult<Value> {
    args.exactly(0)?;
    Ok(host.tenant())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StaticHost;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SUB: &str = "00000000-0000-0000-0000-000000000000";

    fn run(f: super::super::FunctionImpl, name: &str, values: Vec<Value>) -> ExprResult<Value> {
        f(&mut StaticHost::new(), &Args::new(name, values))
    }

    #[test]
    fn test_resource_id_in_current_group() {
        let v = run(
            resource_id,
            "resourceId",
            vec![json!("Microsoft.Storage/storageAccounts"), json!("sa1")],
        )
        .unwrap();
        assert_eq!(
            v,
            json!(format!(
                "/subscriptions/{}/resourceGroups/static-rg/providers/Microsoft.Storage/storageAccounts/sa1",
                SUB
            ))
        );
    }

    #[test]
    fn test_resource_id_with_group_and_subscription() {
        let v = run(
            resource_id,
            "resourceId",
            vec![
                json!("other-sub"),
                json!("other-rg"),
                json!("Microsoft.Network/virtualNetworks/subnets"),
                json!("vnet"),
                json!("default"),
            ],
        )
        .unwrap();
        assert_eq!(
            v,
            json!("/subscriptions/other-sub/resourceGroups/other-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/default")
        );
    }

    #[test]
    fn test_resource_id_name_count_mismatch() {
        let err = run(
            resource_id,
            "resourceId",
            vec![json!("Microsoft.Network/virtualNetworks/subnets"), json!("vnet")],
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidArgument { .. }));
    }

    #[test]
    fn test_resource_group_type_is_subscription_scoped() {
        let v = run(
            resource_id,
            "resourceId",
            vec![json!("Microsoft.Resources/resourceGroups"), json!("rg2")],
        )
        .unwrap();
        assert_eq!(v, json!(format!("/subscriptions/{}/resourceGroups/rg2", SUB)));
    }

    #[test]
    fn test_subscription_and_tenant_ids() {
        let v = run(
            subscription_resource_id,
            "subscriptionResourceId",
            vec![json!("Microsoft.Authorization/roleDefinitions"), json!("abc")],
        )
        .unwrap();
        assert_eq!(
            v,
            json!(format!(
                "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/abc",
                SUB
            ))
        );
        let v = run(
            tenant_resource_id,
            "tenantResourceId",
            vec![json!("Microsoft.Authorization/policyDefinitions"), json!("p1")],
        )
        .unwrap();
        assert_eq!(v, json!("/providers/Microsoft.Authorization/policyDefinitions/p1"));
    }

    #[test]
    fn test_extension_resource_id() {
        let v = run(
            extension_resource_id,
            "extensionResourceId",
            vec![
                json!("/subscriptions/s/resourceGroups/rg"),
                json!("Microsoft.Authorization/locks"),
                json!("lock1"),
            ],
        )
        .unwrap();
        assert_eq!(
            v,
            json!("/subscriptions/s/resourceGroups/rg/providers/Microsoft.Authorization/locks/lock1")
        );
    }
}
