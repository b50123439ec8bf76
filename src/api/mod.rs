//! REST API v1
//!
//! Served over plain HTTP (when `httpWeb.enabled`) and always over the
//! Unix control socket, which also carries the `netfilter.d` hook ingress.
//! Responses are JSON; errors use the `{"error": "..."}` envelope with an
//! appropriate status code. The `save=true` query parameter persists the
//! mutated state to the config file.

pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{error, info};

use crate::app::App;
use crate::error::AppError;
use crate::id::Id;
use crate::models::Rule;

use types::{
    group_from_req, group_res, rule_from_req, rule_res, ErrorRes, GroupReq, GroupsReq, GroupsRes,
    InterfaceRes, InterfacesRes, NetfilterDHookReq, RuleReq, RulesReq,
};

/// Grace period for in-flight requests at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// JSON error with a status code
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, msg.into())
    }

    fn not_found(msg: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, msg.into())
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::GroupIdConflict | AppError::RuleIdConflict => {
                Self(StatusCode::CONFLICT, err.to_string())
            }
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorRes { error: self.1 })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the `/api/v1` router
#[must_use]
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/v1/groups", get(get_groups).put(put_groups).post(post_group))
        .route(
            "/api/v1/groups/{groupID}",
            get(get_group).put(put_group).delete(delete_group),
        )
        .route(
            "/api/v1/groups/{groupID}/rules",
            get(get_rules).put(put_rules).post(post_rule),
        )
        .route(
            "/api/v1/groups/{groupID}/rules/{ruleID}",
            get(get_rule).put(put_rule).delete(delete_rule),
        )
        .route("/api/v1/system/interfaces", get(get_interfaces))
        .route("/api/v1/system/config/save", post(post_config_save))
        .route("/api/v1/system/hooks/netfilterd", post(post_netfilterd))
        .with_state(app)
}

/// Serve the API over TCP until shutdown
pub async fn serve_http(
    app: Arc<App>,
    addr: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "http api listening");
    serve(listener, app, shutdown).await
}

/// Serve the API over the Unix control socket until shutdown
pub async fn serve_unix(
    app: Arc<App>,
    path: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = tokio::net::UnixListener::bind(&path)?;
    info!(path = %path, "unix api listening");
    let result = serve(listener, app, shutdown).await;
    let _ = std::fs::remove_file(&path);
    result
}

async fn serve<L>(
    listener: L,
    app: Arc<App>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError>
where
    L: axum::serve::Listener,
    L::Addr: std::fmt::Debug,
{
    let mut graceful = shutdown.clone();
    let mut deadline = shutdown;
    let server = axum::serve(listener, router(app)).with_graceful_shutdown(async move {
        let _ = graceful.changed().await;
    });

    tokio::select! {
        result = server => result.map_err(AppError::Io),
        () = async {
            let _ = deadline.changed().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => Ok(()),
    }
}

fn should_save(params: &HashMap<String, String>) -> bool {
    params.get("save").is_some_and(|v| v == "true")
}

fn with_rules(params: &HashMap<String, String>) -> bool {
    params.get("with_rules").is_some_and(|v| v == "true")
}

fn save_if_requested(app: &App, params: &HashMap<String, String>) {
    if should_save(params) {
        if let Err(e) = app.save_config() {
            error!(error = %e, "failed to save config file");
        }
    }
}

fn parse_id(raw: &str) -> ApiResult<Id> {
    raw.parse().map_err(|e| ApiError::bad_request(format!("{e}")))
}

fn lookup_group(app: &App, raw_id: &str) -> ApiResult<Arc<crate::group::Group>> {
    let id = parse_id(raw_id)?;
    app.find_group(id)
        .ok_or_else(|| ApiError::not_found("group not found"))
}

// ==================== groups ====================

async fn get_groups(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<GroupsRes>> {
    let with_rules = with_rules(&params);
    let groups = app
        .groups()
        .iter()
        .map(|g| group_res(&g.model(), with_rules))
        .collect();
    Ok(Json(GroupsRes { groups }))
}

async fn put_groups(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<GroupsReq>,
) -> ApiResult<Json<GroupsRes>> {
    let Some(group_reqs) = req.groups else {
        return Err(ApiError::bad_request("no groups in request"));
    };

    let models: Vec<_> = group_reqs.iter().map(group_from_req).collect();

    app.clear_groups().await;
    let mut groups = Vec::with_capacity(models.len());
    for model in models {
        let group = app.add_group(model).await?;
        groups.push(group_res(&group.model(), true));
    }

    save_if_requested(&app, &params);
    Ok(Json(GroupsRes { groups }))
}

async fn post_group(
    State(app): State<Arc<App>>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<GroupReq>,
) -> ApiResult<Response> {
    let model = group_from_req(&req);
    let group = app.add_group(model).await?;
    save_if_requested(&app, &params);
    Ok(Json(group_res(&group.model(), true)).into_response())
}

async fn get_group(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;
    Ok(Json(group_res(&group.model(), with_rules(&params))).into_response())
}

async fn put_group(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<GroupReq>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;
    if let Some(req_id) = req.id {
        if req_id != group.id() {
            return Err(ApiError::bad_request("group id mismatch"));
        }
    }

    let was_enabled = group.is_enabled();
    if was_enabled {
        group.disable().await.map_err(ApiError::internal)?;
    }

    let mut model = group_from_req(&req);
    model.id = group.id();
    group.update_model(|m| *m = model);

    if was_enabled {
        group.enable().await.map_err(ApiError::internal)?;
        group.sync().await.map_err(ApiError::internal)?;
    }

    save_if_requested(&app, &params);
    Ok(Json(group_res(&group.model(), true)).into_response())
}

async fn delete_group(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let group = lookup_group(&app, &group_id)?;
    if group.is_enabled() {
        group.disable().await.map_err(ApiError::internal)?;
    }
    app.remove_group(group.id());
    save_if_requested(&app, &params);
    Ok(StatusCode::OK)
}

// ==================== rules ====================

async fn get_rules(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;
    let rules: Vec<_> = group.model().rules.iter().map(rule_res).collect();
    Ok(Json(serde_json::json!({ "rules": rules })).into_response())
}

async fn put_rules(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<RulesReq>,
) -> ApiResult<Response> {
    let Some(rule_reqs) = req.rules else {
        return Err(ApiError::bad_request("no rules in request"));
    };
    let group = lookup_group(&app, &group_id)?;

    let existing: Vec<Id> = group.model().rules.iter().map(|r| r.id).collect();
    let mut rules: Vec<Rule> = Vec::with_capacity(rule_reqs.len());
    for rule_req in &rule_reqs {
        if let Some(id) = rule_req.id {
            if !existing.contains(&id) {
                return Err(ApiError::not_found("rule not found"));
            }
        }
        rules.push(rule_from_req(rule_req));
    }

    group.update_model(|m| m.rules = rules.clone());
    if group.is_enabled() {
        group.sync().await.map_err(ApiError::internal)?;
    }

    save_if_requested(&app, &params);
    let rules: Vec<_> = rules.iter().map(rule_res).collect();
    Ok(Json(serde_json::json!({ "rules": rules })).into_response())
}

async fn post_rule(
    State(app): State<Arc<App>>,
    Path(group_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<RuleReq>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;

    let rule = rule_from_req(&req);
    let conflict = group.model().rules.iter().any(|r| r.id == rule.id);
    if conflict {
        return Err(ApiError(
            StatusCode::CONFLICT,
            "rule id conflict".to_string(),
        ));
    }

    group.update_model(|m| m.rules.push(rule.clone()));
    if group.is_enabled() {
        group.sync().await.map_err(ApiError::internal)?;
    }

    save_if_requested(&app, &params);
    Ok(Json(rule_res(&rule)).into_response())
}

async fn get_rule(
    State(app): State<Arc<App>>,
    Path((group_id, rule_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;
    let id = parse_id(&rule_id)?;
    let model = group.model();
    let rule = model
        .rules
        .iter()
        .find(|r| r.id == id)
        .ok_or_else(|| ApiError::not_found("rule not found"))?;
    Ok(Json(rule_res(rule)).into_response())
}

async fn put_rule(
    State(app): State<Arc<App>>,
    Path((group_id, rule_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<RuleReq>,
) -> ApiResult<Response> {
    let group = lookup_group(&app, &group_id)?;
    let id = parse_id(&rule_id)?;

    let updated = group.update_model(|m| {
        let rule = m.rules.iter_mut().find(|r| r.id == id)?;
        rule.name = req.name.clone();
        rule.kind = req.kind;
        rule.rule = req.rule.clone();
        rule.enable = req.enable;
        Some(rule.clone())
    });
    let Some(rule) = updated else {
        return Err(ApiError::not_found("rule not found"));
    };

    if group.is_enabled() {
        group.sync().await.map_err(ApiError::internal)?;
    }

    save_if_requested(&app, &params);
    Ok(Json(rule_res(&rule)).into_response())
}

async fn delete_rule(
    State(app): State<Arc<App>>,
    Path((group_id, rule_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    let group = lookup_group(&app, &group_id)?;
    let id = parse_id(&rule_id)?;

    let removed = group.update_model(|m| {
        let before = m.rules.len();
        m.rules.retain(|r| r.id != id);
        m.rules.len() != before
    });
    if !removed {
        return Err(ApiError::not_found("rule not found"));
    }

    if group.is_enabled() {
        group.sync().await.map_err(ApiError::internal)?;
    }

    save_if_requested(&app, &params);
    Ok(StatusCode::OK)
}

// ==================== system ====================

async fn get_interfaces(State(app): State<Arc<App>>) -> ApiResult<Json<InterfacesRes>> {
    let links = app.list_interfaces().await.map_err(ApiError::internal)?;
    Ok(Json(InterfacesRes {
        interfaces: links
            .into_iter()
            .map(|l| InterfaceRes { id: l.name })
            .collect(),
    }))
}

async fn post_config_save(State(app): State<Arc<App>>) -> ApiResult<StatusCode> {
    app.save_config().map_err(ApiError::internal)?;
    Ok(StatusCode::OK)
}

async fn post_netfilterd(
    State(app): State<Arc<App>>,
    Json(req): Json<NetfilterDHookReq>,
) -> ApiResult<StatusCode> {
    if !matches!(req.kind.as_str(), "" | "iptables" | "ip6tables" | "ip4tables") {
        return Err(ApiError::bad_request("unknown iptables type"));
    }
    if !matches!(req.table.as_str(), "" | "filter" | "nat" | "mangle") {
        return Err(ApiError::bad_request("unknown table"));
    }
    app.netfilterd_hook(&req.kind, &req.table).await;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_flags() {
        let mut params = HashMap::new();
        assert!(!should_save(&params));
        assert!(!with_rules(&params));
        params.insert("save".to_string(), "true".to_string());
        params.insert("with_rules".to_string(), "false".to_string());
        assert!(should_save(&params));
        assert!(!with_rules(&params));
    }

    #[test]
    fn test_parse_id_rejects_garbage() {
        assert!(parse_id("deadbeef").is_ok());
        assert!(parse_id("nope").is_err());
        assert!(parse_id("deadbeef00").is_err());
    }
}
