use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::db::{now_rfc3339, upsert_app_settings};
use crate::history::{summarize, EntrySummary, HistoryStore};
use crate::router::IngestRouter;
use crate::settings::{apply_update, Settings, SettingsUpdate};
use crate::sync::{GroupSync, SyncStatus};

#[derive(Clone)]
pub struct AppState {
    pub conn: Arc<Mutex<Connection>>,
    pub settings: Arc<Mutex<Settings>>,
    pub history: HistoryStore,
    pub router: IngestRouter,
    pub sync: GroupSync,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok_json<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn ok_empty() -> Response {
    Json(OkResponse::<Value> { ok: true, data: None }).into_response()
}

fn fail(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

/// Bodies that are not JSON, or not the expected shape, are answered with
/// `invalid_json` inside the usual envelope.
fn parse_body<T: DeserializeOwned>(body: Result<Json<Value>, JsonRejection>) -> Result<T, Response> {
    let value = match body {
        Ok(Json(v)) => v,
        Err(rejection) => {
            warn!("rejected request body: {rejection}");
            return Err(fail(StatusCode::BAD_REQUEST, "invalid_json"));
        }
    };
    serde_json::from_value(value).map_err(|err| {
        warn!("request body has the wrong shape: {err}");
        fail(StatusCode::BAD_REQUEST, "invalid_json")
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/push", post(post_push).options(options_ok))
        .route(
            "/push/registration",
            post(post_push_registration).options(options_ok),
        )
        .route("/push/error", post(post_push_error).options(options_ok))
        .route(
            "/push/unregistered",
            post(post_push_unregistered).options(options_ok),
        )
        .route("/history", get(get_history))
        .route(
            "/settings",
            get(get_settings).post(post_settings).options(options_ok),
        )
        .route("/sync/status", get(get_sync_status))
        .route("/sync", post(post_sync).options(options_ok))
        .route("/demo", post(post_demo).options(options_ok))
        .with_state(state)
        .layer(cors)
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "relay_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

/// The push service hands over `payload` as text; structured payloads are
/// accepted too and stored in their compact JSON form.
fn payload_text(body: &Value) -> Option<String> {
    match body.get("payload")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

async fn post_push(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body: Value = match parse_body(body) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let Some(payload) = payload_text(&body) else {
        return fail(StatusCode::BAD_REQUEST, "missing_payload");
    };
    ok_json(state.router.ingest(&payload).await)
}

async fn post_demo(State(state): State<AppState>) -> Response {
    ok_json(state.router.ingest_demo().await)
}

#[derive(Deserialize)]
struct RegistrationRequest {
    #[serde(default)]
    registration_id: Option<String>,
}

async fn post_push_registration(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let req: RegistrationRequest = match parse_body(body) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let Some(registration_id) = req
        .registration_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return fail(StatusCode::BAD_REQUEST, "missing_registration_id");
    };

    let groups = { state.settings.lock().await.groups.clone() };
    match state.sync.register(&registration_id, &groups).await {
        Ok(status) => ok_json(status),
        Err(err) => {
            error!("register failed: {err:#}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

#[derive(Deserialize)]
struct PushErrorReport {
    #[serde(default)]
    message: String,
}

async fn post_push_error(body: Result<Json<Value>, JsonRejection>) -> Response {
    let req: PushErrorReport = match parse_body(body) {
        Ok(v) => v,
        Err(res) => return res,
    };
    error!("push service error: {}", req.message);
    ok_empty()
}

async fn post_push_unregistered() -> Response {
    info!("push service reported the device as unregistered");
    ok_empty()
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryItem {
    payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<EntrySummary>,
}

async fn get_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(q)) = query else {
        return fail(StatusCode::BAD_REQUEST, "invalid_query");
    };
    match state.history.list().await {
        Ok(entries) => {
            let items: Vec<HistoryItem> = entries
                .into_iter()
                .take(q.limit.unwrap_or(usize::MAX))
                .map(|payload| HistoryItem {
                    summary: summarize(&payload),
                    payload,
                })
                .collect();
            ok_json(items)
        }
        Err(err) => {
            error!("history list failed: {err:#}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

#[derive(Serialize)]
struct SettingsView {
    #[serde(flatten)]
    settings: Settings,
    quiet_summary: String,
    quiet_now: bool,
    known_groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync: Option<SyncStatus>,
}

fn settings_view(state: &AppState, settings: Settings, sync: Option<SyncStatus>) -> SettingsView {
    SettingsView {
        quiet_summary: settings.quiet.summary(),
        quiet_now: settings.quiet.is_quiet_now(),
        known_groups: state.sync.known_groups().to_vec(),
        settings,
        sync,
    }
}

async fn get_settings(State(state): State<AppState>) -> Response {
    let settings = { state.settings.lock().await.clone() };
    ok_json(settings_view(&state, settings, None))
}

async fn post_settings(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let req: SettingsUpdate = match parse_body(body) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let (previous, next) = {
        let mut guard = state.settings.lock().await;
        let next = match apply_update(&guard, &req, state.sync.known_groups()) {
            Ok(v) => v,
            Err(code) => return fail(StatusCode::BAD_REQUEST, code),
        };
        {
            let mut conn = state.conn.lock().await;
            if let Err(err) = upsert_app_settings(&mut conn, &next, &now_rfc3339()) {
                error!("upsert_app_settings failed: {err}");
                return fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error");
            }
        }
        let previous = std::mem::replace(&mut *guard, next.clone());
        (previous, next)
    };

    if next.history_capacity != previous.history_capacity {
        info!("history capacity {} -> {}", previous.history_capacity, next.history_capacity);
        if let Err(err) = state.history.append(None, next.history_capacity as usize).await {
            error!("history trim failed: {err:#}");
        }
    }
    if next.quiet != previous.quiet {
        info!("quiet window now {}", next.quiet.summary());
    }

    let sync = if next.groups != previous.groups {
        info!("group selection changed; syncing with gateway");
        match state.sync.sync_groups(&next.groups).await {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("group sync failed: {err:#}");
                None
            }
        }
    } else {
        None
    };

    ok_json(settings_view(&state, next, sync))
}

#[derive(Serialize)]
struct SyncView {
    user_id: String,
    in_sync: bool,
    registered: bool,
    #[serde(flatten)]
    status: SyncStatus,
}

async fn sync_view(state: &AppState, status: SyncStatus) -> anyhow::Result<SyncView> {
    Ok(SyncView {
        user_id: state.sync.user_id().to_string(),
        in_sync: status.in_sync(),
        registered: state.sync.registration_id().await?.is_some(),
        status,
    })
}

async fn get_sync_status(State(state): State<AppState>) -> Response {
    let view = match state.sync.status().await {
        Ok(status) => sync_view(&state, status).await,
        Err(err) => Err(err),
    };
    match view {
        Ok(v) => ok_json(v),
        Err(err) => {
            error!("sync status failed: {err:#}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}

async fn post_sync(State(state): State<AppState>) -> Response {
    let groups = { state.settings.lock().await.groups.clone() };
    info!("manual gateway sync requested");
    let view = match state.sync.sync_groups(&groups).await {
        Ok(status) => sync_view(&state, status).await,
        Err(err) => Err(err),
    };
    match view {
        Ok(v) => ok_json(v),
        Err(err) => {
            error!("manual sync failed: {err:#}");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
        }
    }
}
