//! HTTP surface
//!
//! - `POST /{groupId}/mcp` - the group's MCP endpoint (JSON-RPC)
//! - `GET /{groupId}/status`, `GET /{groupId}/tools` - introspection
//! - `/admin/...` - groups, connections and validation keys
//! - `GET /health`

use crate::error::HubError;
use crate::groups::GroupExposure;
use crate::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ACCESS_DENIED_CODE, HUB_NAME, HUB_VERSION,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Header carrying a group's validation key
pub const VALIDATION_KEY_HEADER: &str = "x-validation-key";

type AppState = Arc<GroupExposure>;

/// Build the router for every group endpoint plus the admin surface
pub fn router(groups: Arc<GroupExposure>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp", post(missing_group_handler))
        .route("/:group_id/mcp", post(group_mcp_handler))
        .route("/:group_id/status", get(group_status_handler))
        .route("/:group_id/tools", get(group_tools_handler))
        .route("/admin/groups", get(list_groups_handler))
        .route("/admin/connections", get(list_connections_handler))
        .route("/admin/connections/:connection_id/reconnect", post(reconnect_handler))
        .route(
            "/admin/groups/:group_id/validation-key",
            get(key_status_handler)
                .put(set_key_handler)
                .delete(revoke_key_handler),
        )
        .route(
            "/admin/groups/:group_id/validation-key/generate",
            post(generate_key_handler),
        )
        .route(
            "/admin/groups/:group_id/validation-key/validate",
            post(validate_key_handler),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(groups)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(bind_addr: &str, groups: Arc<GroupExposure>, shutdown: F) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "Group endpoints listening");
    axum::serve(listener, router(groups))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Key from `X-Validation-Key`, or from `Authorization: Bearer`
pub fn supplied_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(VALIDATION_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
}

/// JSON-RPC error body with a stable code in `data`
fn rpc_error(status: StatusCode, error: JsonRpcError) -> Response {
    (status, Json(JsonRpcResponse::error(None, error))).into_response()
}

fn group_error(err: &HubError) -> Response {
    let (status, error) = match err {
        HubError::GroupNotFound(_) | HubError::MissingGroupId => (
            StatusCode::NOT_FOUND,
            JsonRpcError::invalid_params(err.to_string()),
        ),
        HubError::AccessDenied(_) => (
            StatusCode::FORBIDDEN,
            JsonRpcError::new(ACCESS_DENIED_CODE, err.to_string()),
        ),
        _ if err.is_access_error() => (
            StatusCode::FORBIDDEN,
            JsonRpcError::invalid_params(err.to_string()),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            JsonRpcError::internal_error(err.to_string()),
        ),
    };
    rpc_error(status, error.with_data(json!({ "code": err.code() })))
}

fn admin_error(err: HubError) -> Response {
    let status = match &err {
        HubError::GroupNotFound(_) | HubError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
        HubError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        HubError::AccessDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": { "code": err.code(), "message": err.to_string() }
        })),
    )
        .into_response()
}

fn require_group(groups: &GroupExposure, group_id: &str) -> Result<(), HubError> {
    if groups.contains(group_id) {
        Ok(())
    } else {
        Err(HubError::GroupNotFound(group_id.to_string()))
    }
}

// === Handlers ===

async fn health_handler(State(groups): State<AppState>) -> impl IntoResponse {
    let hub = groups.hub();
    Json(json!({
        "status": "ok",
        "service": HUB_NAME,
        "version": HUB_VERSION,
        "hub": hub.get_service_status(),
        "pool": hub.pool_stats(),
    }))
}

async fn missing_group_handler() -> Response {
    group_error(&HubError::MissingGroupId)
}

async fn group_mcp_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            if !groups.contains(&group_id) {
                return group_error(&HubError::GroupNotFound(group_id));
            }
            return rpc_error(
                StatusCode::BAD_REQUEST,
                JsonRpcError::parse_error(format!("Invalid JSON-RPC request: {}", e)),
            );
        }
    };

    debug!(group_id = %group_id, method = %request.method, "Group MCP request");
    let key = supplied_key(&headers);
    match groups.handle_request(&group_id, request, key.as_deref()).await {
        Ok(Some(response)) => Json(response).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            if !e.is_access_error() {
                error!(group_id = %group_id, error = %e, "Group request failed");
            }
            group_error(&e)
        }
    }
}

async fn group_status_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
) -> Response {
    match groups.get_health(&group_id) {
        Ok(health) => Json(json!({
            "groupId": group_id,
            "status": health.state,
            "healthy": health.healthy,
            "healthScore": health.health_score,
            "connections": health.connections,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(e) => group_error(&e),
    }
}

async fn group_tools_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = require_group(&groups, &group_id) {
        return group_error(&e);
    }
    let key = supplied_key(&headers);
    if !groups.keys().validate(&group_id, key.as_deref()) {
        return group_error(&HubError::AccessDenied(group_id));
    }

    match groups.resolve_tools(&group_id) {
        Ok(tools) => {
            let definitions: Vec<_> = tools.iter().map(|t| t.to_definition()).collect();
            Json(json!({
                "groupId": group_id,
                "count": definitions.len(),
                "tools": definitions,
                "timestamp": Utc::now(),
            }))
            .into_response()
        }
        Err(e) => group_error(&e),
    }
}

async fn list_groups_handler(State(groups): State<AppState>) -> impl IntoResponse {
    Json(json!({ "groups": groups.list_groups() }))
}

async fn list_connections_handler(State(groups): State<AppState>) -> impl IntoResponse {
    let hub = groups.hub();
    Json(json!({
        "connections": hub.list_connections(),
        "pool": hub.pool_stats(),
    }))
}

async fn reconnect_handler(
    State(groups): State<AppState>,
    Path(connection_id): Path<String>,
) -> Response {
    match groups.hub().reconnect_server(&connection_id).await {
        Ok(connection) => Json(json!({ "connection": connection })).into_response(),
        Err(e) => admin_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct SetKeyRequest {
    key: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ValidateKeyRequest {
    #[serde(default)]
    key: Option<String>,
}

async fn key_status_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
) -> Response {
    match require_group(&groups, &group_id) {
        Ok(()) => Json(groups.keys().status(&group_id)).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn set_key_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
    Json(request): Json<SetKeyRequest>,
) -> Response {
    let result = require_group(&groups, &group_id)
        .and_then(|_| groups.keys().set(&group_id, &request.key, request.enabled));
    match result {
        Ok(status) => Json(status).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn revoke_key_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
) -> Response {
    if let Err(e) = require_group(&groups, &group_id) {
        return admin_error(e);
    }
    let revoked = groups.keys().revoke(&group_id);
    Json(json!({
        "revoked": revoked,
        "status": groups.keys().status(&group_id),
    }))
    .into_response()
}

async fn generate_key_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
) -> Response {
    let result = require_group(&groups, &group_id).and_then(|_| groups.keys().generate(&group_id));
    match result {
        Ok(generated) => (StatusCode::CREATED, Json(generated)).into_response(),
        Err(e) => admin_error(e),
    }
}

async fn validate_key_handler(
    State(groups): State<AppState>,
    Path(group_id): Path<String>,
    Json(request): Json<ValidateKeyRequest>,
) -> Response {
    if let Err(e) = require_group(&groups, &group_id) {
        return admin_error(e);
    }
    let valid = groups.keys().validate(&group_id, request.key.as_deref());
    Json(json!({ "groupId": group_id, "valid": valid })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_key_from_custom_header() {
        let mut headers = HeaderMap::new();
        headers.insert(VALIDATION_KEY_HEADER, HeaderValue::from_static("secret-1"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-2"));
        assert_eq!(supplied_key(&headers).as_deref(), Some("secret-1"));
    }

    #[test]
    fn test_key_from_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret-2"));
        assert_eq!(supplied_key(&headers).as_deref(), Some("secret-2"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(supplied_key(&headers), None);
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        for value in ["bearer secret-3", "BEARER secret-3", "  Bearer   secret-3 "] {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(supplied_key(&headers).as_deref(), Some("secret-3"), "{}", value);
        }

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer"));
        assert_eq!(supplied_key(&headers), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (HubError::MissingGroupId, StatusCode::NOT_FOUND),
            (HubError::AccessDenied("g".into()), StatusCode::FORBIDDEN),
            (
                HubError::ToolNotInGroup {
                    group_id: "g".into(),
                    tool: "A_x".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (HubError::NotInitialized, StatusCode::INTERNAL_SERVER_ERROR),
            (HubError::transport("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(group_error(&err).status(), status, "{}", err);
        }
    }
}
