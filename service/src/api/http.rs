use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State as AxumState},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tally_types::api::{ErrorResponse, StatChangeRequest, StatChangeResponse};
use tally_types::{RefreshInterval, SortMode, Timestamp};

use crate::leaderboards::{self, EntryFilter, PageRequest};
use crate::snapshots::HistoryFilter;
use crate::stats::{self, ChangeRequest, StatChangeError};
use crate::store::{StatDefinition, StatPatch, StoreError};
use crate::{activity, Service};

/// Simple health response for basic liveness checks.
#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

fn store_error_response(err: &StoreError) -> Response {
    tracing::error!("store failure: {err}");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "stat store unavailable")
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn livez() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn readyz(AxumState(service): AxumState<Arc<Service>>) -> Response {
    let status = service.health_status().await;
    if status.ready {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                reason: None,
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                reason: Some("store_unavailable"),
            }),
        )
            .into_response()
    }
}

/// Detailed health for monitoring dashboards.
pub(super) async fn health(AxumState(service): AxumState<Arc<Service>>) -> Response {
    let status = service.health_status().await;
    let http_status = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (http_status, Json(status)).into_response()
}

pub(super) async fn config(AxumState(service): AxumState<Arc<Service>>) -> Response {
    Json(service.config().clone()).into_response()
}

// ── metrics ──────────────────────────────────────────────────────────────

pub(super) async fn pipeline_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.pipeline_metrics_snapshot()).into_response()
}

pub(super) async fn cache_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.cache_metrics_snapshot()).into_response()
}

pub(super) async fn snapshot_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.snapshot_metrics_snapshot()).into_response()
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.http_metrics_snapshot()).into_response()
}

pub(super) async fn system_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(service.system_metrics_snapshot()).into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(service): AxumState<Arc<Service>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    let body = render_prometheus_metrics(&service);
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str())
    {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

/// Validates admin authentication via x-admin-token header or Bearer token.
/// Uses ADMIN_AUTH_TOKEN; if unset, all admin access is blocked.
pub(super) fn admin_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("ADMIN_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return Some(StatusCode::UNAUTHORIZED);
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str())
    {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// ── stat mutation ────────────────────────────────────────────────────────

/// `PUT /v1/stats/:internal_name`. The identity layer supplies the caller
/// through `x-player-id` / `x-alias-id`; scope checks happened upstream.
pub(super) async fn apply_stat_change(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StatChangeRequest>,
) -> Response {
    let start = Instant::now();
    let Some(player_id) = header_string(&headers, "x-player-id") else {
        return error_response(StatusCode::BAD_REQUEST, "missing x-player-id header");
    };
    let alias_id = header_string(&headers, "x-alias-id")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let result = stats::apply_change(
        Arc::clone(&service),
        ChangeRequest {
            player_id,
            alias_id,
            internal_name,
            change: body.change,
            continuity_timestamp: body.continuity_timestamp,
        },
    )
    .await;
    service.http_metrics().record_apply_change(start.elapsed());

    match result {
        Ok(player_stat) => Json(StatChangeResponse { player_stat }).into_response(),
        Err(err @ (StatChangeError::UnknownStat(_) | StatChangeError::UnknownPlayer(_))) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        Err(err) if err.is_client_error() => {
            error_response(StatusCode::BAD_REQUEST, err.to_string())
        }
        Err(err) => {
            tracing::error!("stat change failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "stat store unavailable")
        }
    }
}

// ── stat reads ───────────────────────────────────────────────────────────

pub(super) async fn get_stat(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
) -> Response {
    let store = service.store();
    let stat = tokio::task::spawn_blocking(move || store.stat_by_internal_name(&internal_name))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    match stat {
        Ok(Some(stat)) => Json(stat).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "stat not found"),
        Err(err) => store_error_response(&err),
    }
}

pub(super) async fn get_player_stats(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player_id): Path<String>,
) -> Response {
    match service.player_stats_cached(&player_id).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error_response(&err),
    }
}

pub(super) async fn get_player_stat(
    AxumState(service): AxumState<Arc<Service>>,
    Path((player_id, internal_name)): Path<(String, String)>,
) -> Response {
    match service.player_stat_cached(&player_id, &internal_name).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "player stat not found"),
        Err(err) => store_error_response(&err),
    }
}

// ── history ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HistoryQuery {
    page: Option<u64>,
    player_id: Option<String>,
    alias_id: Option<i64>,
    start_date: Option<Timestamp>,
    end_date: Option<Timestamp>,
}

pub(super) async fn stat_history(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    history_response(service, internal_name, query, false).await
}

pub(super) async fn stat_global_history(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    history_response(service, internal_name, query, true).await
}

async fn history_response(
    service: Arc<Service>,
    internal_name: String,
    query: HistoryQuery,
    global: bool,
) -> Response {
    let start = Instant::now();
    let Some(snapshots) = service.snapshots() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "analytics store disabled");
    };

    let store = service.store();
    let stat = tokio::task::spawn_blocking(move || store.stat_by_internal_name(&internal_name))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    let stat = match stat {
        Ok(Some(stat)) => stat,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "stat not found"),
        Err(err) => return store_error_response(&err),
    };
    if global && !stat.global {
        return error_response(StatusCode::BAD_REQUEST, "stat is not globally aggregated");
    }

    let filter = HistoryFilter {
        player_id: query.player_id,
        alias_id: query.alias_id,
        start: query.start_date,
        end: query.end_date,
    };
    let per_page = service.config().items_per_page();
    let page = query.page.unwrap_or(0);
    let result = tokio::task::spawn_blocking(move || {
        if global {
            snapshots.global_history(stat.id, &filter, page, per_page)
        } else {
            snapshots.history(stat.id, &filter, page, per_page)
        }
    })
    .await;
    service.http_metrics().record_history(start.elapsed());

    match result {
        Ok(Ok(page)) => Json(page).into_response(),
        Ok(Err(err)) => {
            tracing::error!("history query failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "history query failed")
        }
        Err(err) => {
            tracing::error!("history task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "history query failed")
        }
    }
}

// ── leaderboards ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EntriesQuery {
    page: Option<u64>,
    alias_id: Option<i64>,
    prop_key: Option<String>,
    prop_value: Option<String>,
    with_deleted: Option<bool>,
    with_dev: Option<bool>,
}

/// `GET /v1/leaderboards/:internal_name/entries`. Restricted callers never
/// see hidden or soft-deleted entries no matter what they ask for; the admin
/// scope unlocks both.
pub(super) async fn list_leaderboard_entries(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EntriesQuery>,
) -> Response {
    let start = Instant::now();
    let privileged = admin_auth_error(&headers).is_none();
    let filter = EntryFilter {
        alias_id: query.alias_id,
        with_deleted: privileged && query.with_deleted.unwrap_or(false),
        include_hidden: privileged,
        include_dev: query.with_dev.unwrap_or(false),
        include_archived: false,
        prop_key: query.prop_key,
        prop_value: query.prop_value,
    };
    let page = PageRequest {
        page: query.page.unwrap_or(0),
        per_page: service.config().items_per_page(),
    };

    let store = service.store();
    let result = tokio::task::spawn_blocking(move || {
        let Some(board) = store.leaderboard_by_internal_name(&internal_name)? else {
            return Ok(None);
        };
        leaderboards::list_entries(&store, &board, &filter, &page).map(Some)
    })
    .await
    .map_err(|_| StoreError::Task)
    .and_then(|result| result);
    service.http_metrics().record_list_entries(start.elapsed());

    match result {
        Ok(Some(page)) => Json(page).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "leaderboard not found"),
        Err(err) => store_error_response(&err),
    }
}

// ── admin ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateStatBody {
    internal_name: String,
    name: String,
    #[serde(default)]
    default_value: f64,
    min_value: Option<f64>,
    max_value: Option<f64>,
    max_change: Option<f64>,
    #[serde(default)]
    min_time_between_updates: u64,
    #[serde(default)]
    global: bool,
}

pub(super) async fn admin_create_stat(
    AxumState(service): AxumState<Arc<Service>>,
    headers: HeaderMap,
    Json(body): Json<CreateStatBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let definition = StatDefinition {
        internal_name: body.internal_name,
        name: body.name,
        default_value: body.default_value,
        min_value: body.min_value,
        max_value: body.max_value,
        max_change: body.max_change,
        min_time_between_updates: body.min_time_between_updates,
        global: body.global,
    };
    let result = tokio::task::spawn_blocking(move || store.create_stat(&definition))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    match result {
        Ok(stat) => {
            activity::stat_definition_changed("admin", &stat.internal_name);
            (StatusCode::CREATED, Json(stat)).into_response()
        }
        Err(StoreError::Unavailable(rusqlite::Error::SqliteFailure(err, message)))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            error_response(
                StatusCode::CONFLICT,
                message.unwrap_or_else(|| "stat already exists".to_string()),
            )
        }
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PatchStatBody {
    name: Option<String>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    max_change: Option<f64>,
    min_time_between_updates: Option<u64>,
}

pub(super) async fn admin_update_stat(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PatchStatBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let patch = StatPatch {
        name: body.name,
        min_value: body.min_value.map(Some),
        max_value: body.max_value.map(Some),
        max_change: body.max_change.map(Some),
        min_time_between_updates: body.min_time_between_updates,
    };
    let result = tokio::task::spawn_blocking(move || store.update_stat(&internal_name, &patch))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    match result {
        Ok(Some(stat)) => {
            activity::stat_definition_changed("admin", &stat.internal_name);
            Json(stat).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "stat not found"),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreatePlayerBody {
    id: Option<String>,
    #[serde(default)]
    dev_build: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerResponse {
    id: String,
    dev_build: bool,
}

pub(super) async fn admin_create_player(
    AxumState(service): AxumState<Arc<Service>>,
    headers: HeaderMap,
    Json(body): Json<CreatePlayerBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store = service.store();
    let dev_build = body.dev_build;
    let now = crate::unix_now();
    let created = {
        let id = id.clone();
        tokio::task::spawn_blocking(move || store.create_player(&id, dev_build, now))
            .await
            .map_err(|_| StoreError::Task)
            .and_then(|result| result)
    };
    match created {
        Ok(()) => (StatusCode::CREATED, Json(PlayerResponse { id, dev_build })).into_response(),
        Err(err) => store_error_response(&err),
    }
}

pub(super) async fn admin_delete_player(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let deleted = {
        let player_id = player_id.clone();
        tokio::task::spawn_blocking(move || store.delete_player(&player_id))
            .await
            .map_err(|_| StoreError::Task)
            .and_then(|result| result)
    };
    match deleted {
        Ok(true) => {
            service.defer_invalidate_player(&player_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "player not found"),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateAliasBody {
    service: Option<String>,
    identifier: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AliasResponse {
    id: i64,
    player_id: String,
}

pub(super) async fn admin_create_alias(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateAliasBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let created = {
        let player_id = player_id.clone();
        tokio::task::spawn_blocking(move || {
            store.create_alias(
                &player_id,
                body.service.as_deref().unwrap_or("username"),
                &body.identifier,
            )
        })
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result)
    };
    match created {
        Ok(id) => (
            StatusCode::CREATED,
            Json(AliasResponse { id, player_id }),
        )
            .into_response(),
        Err(err) => store_error_response(&err),
    }
}

/// Bulk reset of a player's stat rows.
pub(super) async fn admin_reset_player_stats(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let reset = {
        let player_id = player_id.clone();
        tokio::task::spawn_blocking(move || store.reset_player_stats(&player_id))
            .await
            .map_err(|_| StoreError::Task)
            .and_then(|result| result)
    };
    match reset {
        Ok(count) => {
            service.defer_invalidate_player(&player_id);
            Json(serde_json::json!({ "deleted": count })).into_response()
        }
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateLeaderboardBody {
    internal_name: String,
    name: String,
    sort_mode: Option<String>,
    #[serde(default)]
    unique_entries: bool,
}

pub(super) async fn admin_create_leaderboard(
    AxumState(service): AxumState<Arc<Service>>,
    headers: HeaderMap,
    Json(body): Json<CreateLeaderboardBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let sort_mode = match body.sort_mode.as_deref() {
        Some(value) => match SortMode::from_str(value) {
            Ok(mode) => mode,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
        },
        None => SortMode::Desc,
    };
    let store = service.store();
    let created = tokio::task::spawn_blocking(move || {
        store.create_leaderboard(
            &body.internal_name,
            &body.name,
            sort_mode,
            body.unique_entries,
        )
    })
    .await
    .map_err(|_| StoreError::Task)
    .and_then(|result| result);
    match created {
        Ok(board) => (StatusCode::CREATED, Json(board)).into_response(),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PatchLeaderboardBody {
    refresh_interval: String,
}

/// Changing the refresh interval away from `never` archives live entries.
pub(super) async fn admin_update_leaderboard(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PatchLeaderboardBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let interval = match RefreshInterval::from_str(&body.refresh_interval) {
        Ok(interval) => interval,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err),
    };
    let store = service.store();
    let now = crate::unix_now();
    let result = tokio::task::spawn_blocking(move || {
        let Some(board) = store.leaderboard_by_internal_name(&internal_name)? else {
            return Ok(None);
        };
        let archived = store.set_refresh_interval(board.id, interval, now)?;
        Ok(Some(archived))
    })
    .await
    .map_err(|_| StoreError::Task)
    .and_then(|result| result);
    match result {
        Ok(Some(archived)) => Json(serde_json::json!({ "archived": archived })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "leaderboard not found"),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateEntryBody {
    alias_id: i64,
    score: f64,
    #[serde(default)]
    props: BTreeMap<String, String>,
}

/// The score-submission collaborator's seam, exposed for seeding and admin
/// tooling.
pub(super) async fn admin_create_entry(
    AxumState(service): AxumState<Arc<Service>>,
    Path(internal_name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateEntryBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let now = crate::unix_now();
    let result = tokio::task::spawn_blocking(move || {
        let Some(board) = store.leaderboard_by_internal_name(&internal_name)? else {
            return Ok(None);
        };
        store
            .create_entry(&board, body.alias_id, body.score, &body.props, now)
            .map(Some)
    })
    .await
    .map_err(|_| StoreError::Task)
    .and_then(|result| result);
    match result {
        Ok(Some(entry)) => (StatusCode::CREATED, Json(entry)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "leaderboard not found"),
        Err(err) => store_error_response(&err),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct PatchEntryBody {
    score: Option<f64>,
    hidden: Option<bool>,
}

pub(super) async fn admin_update_entry(
    AxumState(service): AxumState<Arc<Service>>,
    Path(entry_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<PatchEntryBody>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let score = body.score;
    let hidden = body.hidden;
    let result = tokio::task::spawn_blocking(move || store.update_entry(entry_id, score, hidden))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    match result {
        Ok(Some(entry)) => {
            activity::entry_updated("admin", entry.id, score, hidden);
            Json(entry).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "entry not found"),
        Err(err) => store_error_response(&err),
    }
}

pub(super) async fn admin_delete_entry(
    AxumState(service): AxumState<Arc<Service>>,
    Path(entry_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return status.into_response();
    }
    let store = service.store();
    let now = crate::unix_now();
    let deleted = tokio::task::spawn_blocking(move || store.soft_delete_entry(entry_id, now))
        .await
        .map_err(|_| StoreError::Task)
        .and_then(|result| result);
    match deleted {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "entry not found"),
        Err(err) => store_error_response(&err),
    }
}

// ── prometheus rendering ─────────────────────────────────────────────────

fn render_prometheus_metrics(service: &Service) -> String {
    use std::fmt::Write as _;

    let pipeline = service.pipeline_metrics_snapshot();
    let cache = service.cache_metrics_snapshot();
    let snapshots = service.snapshot_metrics_snapshot();
    let http = service.http_metrics_snapshot();
    let system = service.system_metrics_snapshot();

    let mut out = String::new();
    let mut counter = |name: &str, value: u64| {
        let _ = writeln!(out, "# TYPE {name} counter\n{name} {value}");
    };
    counter("tally_pipeline_applied_total", pipeline.applied);
    counter(
        "tally_pipeline_rejected_throttled_total",
        pipeline.rejected_throttled,
    );
    counter(
        "tally_pipeline_rejected_magnitude_total",
        pipeline.rejected_magnitude,
    );
    counter(
        "tally_pipeline_rejected_range_total",
        pipeline.rejected_range,
    );
    counter(
        "tally_pipeline_rejected_unknown_total",
        pipeline.rejected_unknown,
    );
    counter("tally_pipeline_store_errors_total", pipeline.store_errors);
    counter("tally_cache_hits_total", cache.hits);
    counter("tally_cache_misses_total", cache.misses);
    counter(
        "tally_cache_invalidations_enqueued_total",
        cache.invalidations_enqueued,
    );
    counter(
        "tally_cache_invalidations_dropped_total",
        cache.invalidations_dropped,
    );
    counter(
        "tally_cache_invalidations_applied_total",
        cache.invalidations_applied,
    );
    counter("tally_snapshots_flushed_total", snapshots.flushed);
    counter("tally_snapshots_dropped_total", snapshots.dropped);
    counter("tally_snapshots_retries_total", snapshots.retries);
    counter("tally_http_reject_rate_limit_total", http.reject_rate_limit);
    counter("tally_http_reject_body_limit_total", http.reject_body_limit);

    let mut gauge = |name: &str, value: f64| {
        let _ = writeln!(out, "# TYPE {name} gauge\n{name} {value}");
    };
    gauge(
        "tally_snapshots_queue_depth",
        snapshots.queue_depth as f64,
    );
    gauge(
        "tally_snapshots_queue_high_water",
        snapshots.queue_high_water as f64,
    );
    gauge("tally_system_rss_bytes", system.rss_bytes as f64);
    gauge("tally_system_cpu_usage_percent", system.cpu_usage_percent);

    for (name, latency) in [
        ("tally_http_apply_change_latency_ms", &http.apply_change),
        ("tally_http_list_entries_latency_ms", &http.list_entries),
        ("tally_http_history_latency_ms", &http.history),
    ] {
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0u64;
        for (bucket, count) in latency.buckets_ms.iter().zip(latency.counts.iter()) {
            cumulative += count;
            let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
        }
        let _ = writeln!(
            out,
            "{name}_bucket{{le=\"+Inf\"}} {}",
            cumulative + latency.overflow
        );
        let _ = writeln!(out, "{name}_count {}", latency.count);
    }

    out
}
