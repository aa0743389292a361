//! Group endpoints over a live hub

mod common;

use common::{config_for, tool, MockConnector};
use op_mcp_hub::config::{GroupConfig, GroupValidationConfig};
use op_mcp_hub::connection::ReconnectPolicy;
use op_mcp_hub::groups::{GroupExposure, GroupState};
use op_mcp_hub::protocol::{JsonRpcRequest, ACCESS_DENIED_CODE};
use op_mcp_hub::validation::{hash_key, ValidationKeyStore};
use op_mcp_hub::{HubError, HubOrchestrator};
use serde_json::json;
use std::sync::Arc;

const KEY: &str = "correct-horse-battery";

/// A{x, y} and B{x} connected, C configured but unreachable
async fn setup() -> (Arc<MockConnector>, GroupExposure) {
    let connector = MockConnector::new();
    connector.backend("A", vec![tool("x"), tool("y")]);
    connector.backend("B", vec![tool("x")]);
    connector.backend("C", vec![tool("z")]).set_failing(true);

    let hub = Arc::new(HubOrchestrator::new(
        connector.clone(),
        ReconnectPolicy::disabled(),
    ));
    hub.initialize_from_config(&config_for(&["A", "B", "C"]).build())
        .await
        .unwrap();

    let exposure = GroupExposure::new(hub, Arc::new(ValidationKeyStore::new()));
    exposure
        .upsert_group(
            "g1",
            GroupConfig::new("Group one")
                .with_servers(vec!["A"])
                .with_tools(vec!["x"]),
        )
        .unwrap();
    (connector, exposure)
}

fn names(tools: Vec<op_mcp_hub::ToolDescriptor>) -> Vec<String> {
    tools.into_iter().map(|t| t.qualified_name).collect()
}

#[tokio::test]
async fn test_resolve_tools_respects_members_and_whitelist() {
    let (_connector, exposure) = setup().await;

    // B also reports "x", but B is not a member.
    assert_eq!(names(exposure.resolve_tools("g1").unwrap()), vec!["A_x"]);

    exposure
        .upsert_group("all-a", GroupConfig::new("All of A").with_servers(vec!["A"]))
        .unwrap();
    assert_eq!(names(exposure.resolve_tools("all-a").unwrap()), vec!["A_x", "A_y"]);

    assert!(matches!(
        exposure.resolve_tools("nope"),
        Err(HubError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_group_view_follows_member_connectivity() {
    let (_connector, exposure) = setup().await;
    let hub = exposure.hub().clone();

    hub.manager().disconnect("A").await.unwrap();
    assert!(exposure.resolve_tools("g1").unwrap().is_empty());

    hub.reconnect_server("A").await.unwrap();
    assert_eq!(names(exposure.resolve_tools("g1").unwrap()), vec!["A_x"]);
}

#[tokio::test]
async fn test_call_dispatches_to_owner() {
    let (connector, exposure) = setup().await;

    let result = exposure
        .handle_call("g1", "A_x", json!({ "q": 1 }), None)
        .await
        .unwrap();
    assert!(!result.is_error);
    assert_eq!(connector.get("A").calls(), vec![("x".to_string(), json!({ "q": 1 }))]);
    assert!(connector.get("B").calls().is_empty());

    // Raw names are fine while unique within the group.
    let by_raw = exposure.handle_call("g1", "x", json!({}), None).await.unwrap();
    assert_eq!(by_raw.tool_name, "A_x");
}

#[tokio::test]
async fn test_tool_not_in_group() {
    let (_connector, exposure) = setup().await;

    for name in ["A_y", "B_x", "A_missing"] {
        let err = exposure
            .handle_call("g1", name, json!({}), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, HubError::ToolNotInGroup { ref tool, .. } if tool == name),
            "{} should not be reachable through g1",
            name
        );
    }

    let missing_group = exposure.handle_call("zz", "A_x", json!({}), None).await;
    assert!(matches!(missing_group, Err(HubError::GroupNotFound(_))));
}

#[tokio::test]
async fn test_raw_name_ambiguous_within_group() {
    let (_connector, exposure) = setup().await;
    exposure
        .upsert_group(
            "shared",
            GroupConfig::new("Shared").with_servers(vec!["A", "B"]).with_tools(vec!["x"]),
        )
        .unwrap();

    let err = exposure
        .handle_call("shared", "x", json!({}), None)
        .await
        .unwrap_err();
    match err {
        HubError::AmbiguousToolName { candidates, .. } => {
            assert_eq!(candidates, vec!["A_x", "B_x"])
        }
        other => panic!("unexpected error: {}", other),
    }

    let qualified = exposure
        .handle_call("shared", "B_x", json!({}), None)
        .await
        .unwrap();
    assert_eq!(qualified.connection_id.as_deref(), Some("B"));
}

#[tokio::test]
async fn test_validation_key_gates_calls() {
    let (_connector, exposure) = setup().await;
    exposure.keys().set("g1", KEY, true).unwrap();

    let denied = exposure.handle_call("g1", "A_x", json!({}), None).await;
    assert!(matches!(denied, Err(HubError::AccessDenied(_))));

    let wrong = exposure
        .handle_call("g1", "A_x", json!({}), Some("not-the-key"))
        .await;
    assert!(matches!(wrong, Err(HubError::AccessDenied(_))));

    let allowed = exposure
        .handle_call("g1", "A_x", json!({}), Some(KEY))
        .await
        .unwrap();
    assert!(!allowed.is_error);
}

#[tokio::test]
async fn test_revoke_then_disable() {
    let (_connector, exposure) = setup().await;
    exposure.keys().set("g1", KEY, true).unwrap();
    assert!(exposure.keys().revoke("g1"));

    // Still enforced with no key on record: nothing gets in.
    for key in [None, Some(KEY), Some("anything-else")] {
        let result = exposure.handle_call("g1", "A_x", json!({}), key).await;
        assert!(matches!(result, Err(HubError::AccessDenied(_))));
    }

    exposure.keys().set_enabled("g1", false);
    for key in [None, Some(KEY), Some("anything-else")] {
        assert!(exposure.handle_call("g1", "A_x", json!({}), key).await.is_ok());
    }
}

#[tokio::test]
async fn test_key_hash_seeded_from_config() {
    let (_connector, exposure) = setup().await;
    let mut group = GroupConfig::new("Locked").with_servers(vec!["A"]);
    group.validation = Some(GroupValidationConfig {
        enabled: true,
        key_hash: Some(hash_key(KEY)),
    });
    exposure.upsert_group("locked", group).unwrap();

    let status = exposure.keys().status("locked");
    assert!(status.enabled && status.has_key);
    assert!(exposure.handle_call("locked", "A_x", json!({}), None).await.is_err());
    assert!(exposure
        .handle_call("locked", "A_x", json!({}), Some(KEY))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_health_scores() {
    let (_connector, exposure) = setup().await;

    let healthy = exposure.get_health("g1").unwrap();
    assert!(healthy.healthy);
    assert_eq!(healthy.state, GroupState::Healthy);
    assert_eq!(healthy.health_score, 1.0);

    exposure
        .upsert_group("mixed", GroupConfig::new("Mixed").with_servers(vec!["A", "C"]))
        .unwrap();
    let mixed = exposure.get_health("mixed").unwrap();
    assert!(mixed.healthy);
    assert_eq!(mixed.state, GroupState::Degraded);
    assert_eq!(mixed.health_score, 0.5);
    assert!(mixed.connections[1].last_error.is_some());

    exposure
        .upsert_group("empty", GroupConfig::new("Empty"))
        .unwrap();
    let empty = exposure.get_health("empty").unwrap();
    assert!(!empty.healthy);
    assert_eq!(empty.health_score, 0.0);
    assert_eq!(empty.state, GroupState::Unhealthy);
}

#[tokio::test]
async fn test_upsert_invalidates_built_endpoint() {
    let (_connector, exposure) = setup().await;
    assert!(!exposure.is_built("g1"));

    exposure.resolve_tools("g1").unwrap();
    assert!(exposure.is_built("g1"));

    exposure
        .upsert_group(
            "g1",
            GroupConfig::new("Group one").with_servers(vec!["A"]).with_tools(vec!["y"]),
        )
        .unwrap();
    assert!(!exposure.is_built("g1"));
    assert_eq!(names(exposure.resolve_tools("g1").unwrap()), vec!["A_y"]);

    exposure.remove_group("g1").unwrap();
    assert!(!exposure.contains("g1"));
    assert!(matches!(
        exposure.remove_group("g1"),
        Err(HubError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_invalid_group_ids_rejected() {
    let (_connector, exposure) = setup().await;
    for id in ["", "a/b", "admin"] {
        assert!(exposure.upsert_group(id, GroupConfig::new("bad")).is_err());
    }
}

#[tokio::test]
async fn test_jsonrpc_surface() {
    let (_connector, exposure) = setup().await;

    let init = exposure
        .handle_request("g1", JsonRpcRequest::new("initialize").with_id(1), None)
        .await
        .unwrap()
        .unwrap();
    let result = init.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "op-mcp-hub/g1");

    let ping = exposure
        .handle_request("g1", JsonRpcRequest::new("ping").with_id(2), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ping.result, Some(json!({})));

    let listed = exposure
        .handle_request("g1", JsonRpcRequest::new("tools/list").with_id(3), None)
        .await
        .unwrap()
        .unwrap();
    let tools = listed.result.unwrap()["tools"].clone();
    assert_eq!(tools.as_array().unwrap().len(), 1);
    assert_eq!(tools[0]["name"], "A_x");

    let called = exposure
        .handle_request(
            "g1",
            JsonRpcRequest::new("tools/call")
                .with_id(4)
                .with_params(json!({ "name": "A_x", "arguments": {} })),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(called.result.unwrap()["isError"], false);

    let notification = exposure
        .handle_request("g1", JsonRpcRequest::notification("notifications/initialized"), None)
        .await
        .unwrap();
    assert!(notification.is_none());

    let unknown = exposure
        .handle_request("g1", JsonRpcRequest::new("resources/list").with_id(5), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unknown.error.unwrap().code, -32601);

    assert!(matches!(
        exposure
            .handle_request("zz", JsonRpcRequest::new("ping").with_id(6), None)
            .await,
        Err(HubError::GroupNotFound(_))
    ));
}

#[tokio::test]
async fn test_jsonrpc_errors_carry_stable_codes() {
    let (_connector, exposure) = setup().await;
    exposure.keys().set("g1", KEY, true).unwrap();

    let denied = exposure
        .handle_request("g1", JsonRpcRequest::new("tools/list").with_id(1), None)
        .await
        .unwrap()
        .unwrap();
    let error = denied.error.unwrap();
    assert_eq!(error.code, ACCESS_DENIED_CODE);
    assert_eq!(error.data.unwrap()["code"], "ACCESS_DENIED");

    let not_in_group = exposure
        .handle_request(
            "g1",
            JsonRpcRequest::new("tools/call")
                .with_id(2)
                .with_params(json!({ "name": "A_y" })),
            Some(KEY),
        )
        .await
        .unwrap()
        .unwrap();
    let error = not_in_group.error.unwrap();
    assert_eq!(error.code, -32602);
    assert_eq!(error.data.unwrap()["code"], "TOOL_NOT_IN_GROUP");
}
