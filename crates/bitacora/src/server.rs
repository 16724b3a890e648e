use anyhow::{bail, Context};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{self, AdminUser, CurrentUser, SessionClaims, SessionKey};
use crate::config::Config;
use crate::error::AppError;
use crate::export;
use crate::extracts::{self, ExtractInfo};
use crate::html;
use crate::kpi::{self, Filter, KpiReport};
use crate::store::{open_audit_store, AuditQuery, AuditStore, UserStore};
use crate::types::{Audit, NewAudit, NewUser, PublicUser, UserUpdate};

/// Largest accepted extract upload
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Application state shared across requests
pub struct AppState {
    pub users: UserStore,
    pub audits: Arc<dyn AuditStore>,
    pub extracts: RwLock<Vec<ExtractInfo>>,
    pub extracts_dir: PathBuf,
    pub session_key: SessionKey,
    /// Largest accepted upload body, in bytes
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            users: UserStore::open(config.users_path()),
            audits: open_audit_store(config.store, &config.data_dir)?,
            extracts: RwLock::new(Vec::new()),
            extracts_dir: config.extracts_dir(),
            session_key: config.session_key(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
        })
    }
}

/// Create the first admin account when there are no users yet
pub fn bootstrap_admin(users: &UserStore, password: Option<&str>) -> anyhow::Result<()> {
    if !users.is_empty()? {
        return Ok(());
    }

    let Some(password) = password.filter(|p| !p.trim().is_empty()) else {
        bail!(
            "No users exist yet. Set BITACORA_ADMIN_PASSWORD (or --admin-password) to create the initial admin account"
        );
    };

    users.create(NewUser {
        username: "admin".to_string(),
        password: password.to_string(),
        full_name: "Administrador".to_string(),
        role: "admin".to_string(),
        position: String::new(),
        signature: None,
    })?;
    warn!("Created initial admin account 'admin'");
    Ok(())
}

/// Start the web server with extract watching
pub async fn serve(config: &Config, bind: IpAddr, port: u16) -> anyhow::Result<()> {
    config.ensure_dirs()?;

    let state = Arc::new(AppState::open(config)?);
    bootstrap_admin(&state.users, config.admin_password.as_deref())?;

    let count = refresh_extracts(&state).await?;
    info!(count = count, dir = %state.extracts_dir.display(), "Extracts indexed");

    // Dropping the debouncer stops the watcher
    let _watcher = start_file_watcher(state.clone())?;

    let app = router(state);

    let addr = SocketAddr::new(bind, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %format!("http://{}", addr), "Server running");

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let upload_limit = DefaultBodyLimit::max(state.max_upload_bytes);

    Router::new()
        .route("/", get(index_handler))
        .route("/login", get(login_page_handler))
        .route("/audits/{id}/report", get(audit_report_handler))
        .route("/extracts/{name}/report", get(kpi_report_handler))
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .route("/api/session", get(session_handler))
        .route("/api/users", get(list_users_handler).post(create_user_handler))
        .route(
            "/api/users/{id}",
            get(get_user_handler)
                .put(update_user_handler)
                .delete(delete_user_handler),
        )
        .route("/api/audits", get(list_audits_handler).post(create_audit_handler))
        .route("/api/audits/export.csv", get(export_audits_handler))
        .route(
            "/api/audits/{id}",
            get(get_audit_handler).delete(delete_audit_handler),
        )
        .route(
            "/api/extracts",
            get(list_extracts_handler)
                .post(upload_extract_handler)
                .layer(upload_limit),
        )
        .route("/api/extracts/refresh", get(refresh_extracts_handler))
        .route("/api/extracts/{name}", delete(delete_extract_handler))
        .route("/api/extracts/{name}/kpi", get(kpi_handler))
        .route("/api/extracts/{name}/kpi.csv", get(kpi_csv_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rescan the extracts directory into the in-memory index
async fn refresh_extracts(state: &AppState) -> anyhow::Result<usize> {
    let dir = state.extracts_dir.clone();
    let scanned = tokio::task::spawn_blocking(move || extracts::scan(&dir))
        .await
        .context("Extract scan task failed")??;

    let mut index = state.extracts.write().await;
    *index = scanned;
    Ok(index.len())
}

fn is_extract_path(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| !n.starts_with('.') && extracts::sanitize_name(n).is_ok())
        .unwrap_or(false)
}

/// Watch the extracts directory and refresh the index on changes
fn start_file_watcher(
    state: Arc<AppState>,
) -> anyhow::Result<Debouncer<RecommendedWatcher>> {
    // Capacity 1: a pending refresh already covers later changes
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);

    let mut debouncer = new_debouncer(Duration::from_secs(2), move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                if events.iter().any(|e| is_extract_path(&e.path)) {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = ?e, "File watcher error"),
        }
    })
    .context("Failed to create file watcher")?;

    debouncer
        .watcher()
        .watch(&state.extracts_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", state.extracts_dir.display()))?;
    info!(dir = %state.extracts_dir.display(), "Watching for extract changes");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            let before = state.extracts.read().await.len();
            match refresh_extracts(&state).await {
                Ok(after) => info!(
                    count = after,
                    change = after as i64 - before as i64,
                    "Extracts changed on disk"
                ),
                Err(e) => warn!(error = %e, "Failed to refresh extracts"),
            }
        }
    });

    Ok(debouncer)
}

async fn load_report(state: &AppState, name: String, filter: Filter) -> Result<KpiReport, AppError> {
    let filter = filter.normalized();
    filter.month_start().map_err(AppError::Validation)?;

    let dir = state.extracts_dir.clone();
    let source = name.clone();
    let table = tokio::task::spawn_blocking(move || extracts::load_table(&dir, &source))
        .await
        .context("Extract read task failed")?
        .map_err(|e| AppError::Validation(format!("No se pudo leer el archivo {}: {}", name, e)))?
        .ok_or_else(|| AppError::NotFound("Extracto no encontrado".to_string()))?;

    Ok(kpi::compute(&table, &filter, &name))
}

fn csv_response(file_name: &str, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        body,
    )
        .into_response()
}

// ========== Pages ==========

async fn index_handler(
    State(state): State<Arc<AppState>>,
    user: Result<CurrentUser, AppError>,
) -> Result<Response, AppError> {
    let Ok(CurrentUser(user)) = user else {
        return Ok(Redirect::to("/login").into_response());
    };

    let audits = state.audits.list(&AuditQuery::default())?;
    let extracts = state.extracts.read().await.clone();
    let users: Option<Vec<PublicUser>> = if user.is_admin() {
        Some(state.users.list()?.iter().map(|u| u.public()).collect())
    } else {
        None
    };

    let markup = html::render_dashboard(&user, &audits, &extracts, users.as_deref());
    Ok(Html(markup.into_string()).into_response())
}

async fn login_page_handler() -> Html<String> {
    Html(html::render_login().into_string())
}

async fn audit_report_handler(
    State(state): State<Arc<AppState>>,
    user: Result<CurrentUser, AppError>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    if user.is_err() {
        return Ok(Redirect::to("/login").into_response());
    }

    let audit = state
        .audits
        .get(&id)?
        .ok_or_else(|| AppError::NotFound("Auditoría no encontrada".to_string()))?;
    let auditor = state.users.find_by_username(&audit.auditor)?;

    let markup = html::render_audit_report(&audit, auditor.as_ref());
    Ok(Html(markup.into_string()).into_response())
}

async fn kpi_report_handler(
    State(state): State<Arc<AppState>>,
    user: Result<CurrentUser, AppError>,
    Path(name): Path<String>,
    Query(filter): Query<Filter>,
) -> Result<Response, AppError> {
    if user.is_err() {
        return Ok(Redirect::to("/login").into_response());
    }

    let report = load_report(&state, name, filter).await?;
    Ok(Html(html::render_kpi_report(&report).into_string()).into_response())
}

// ========== Session ==========

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload?;

    let Some(user) = state.users.authenticate(&request.username, &request.password)? else {
        warn!(username = %request.username.trim(), "Failed login");
        return Err(AppError::InvalidCredentials);
    };

    let claims = SessionClaims::for_user(&user, chrono::Utc::now().timestamp());
    let cookie = auth::session_cookie(&state.session_key.seal(&claims)?);
    info!(username = %user.username, "Login");

    Ok(([(header::SET_COOKIE, cookie)], Json(user.public())).into_response())
}

async fn logout_handler() -> impl IntoResponse {
    (
        [(header::SET_COOKIE, auth::clear_session_cookie())],
        Json(json!({ "ok": true })),
    )
}

async fn session_handler(CurrentUser(user): CurrentUser) -> Json<PublicUser> {
    Json(user.public())
}

// ========== Users ==========

async fn list_users_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
) -> Result<Json<Vec<PublicUser>>, AppError> {
    let users = state.users.list()?;
    Ok(Json(users.iter().map(|u| u.public()).collect()))
}

async fn create_user_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    payload: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<PublicUser>), AppError> {
    let Json(new) = payload?;
    let user = state.users.create(new)?;
    Ok((StatusCode::CREATED, Json(user.public())))
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<Json<PublicUser>, AppError> {
    state
        .users
        .get(&id)?
        .map(|u| Json(u.public()))
        .ok_or_else(|| AppError::NotFound("Usuario no encontrado".to_string()))
}

async fn update_user_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(id): Path<String>,
    payload: Result<Json<UserUpdate>, JsonRejection>,
) -> Result<Json<PublicUser>, AppError> {
    let Json(update) = payload?;
    state
        .users
        .update(&id, update)?
        .map(|u| Json(u.public()))
        .ok_or_else(|| AppError::NotFound("Usuario no encontrado".to_string()))
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.users.delete(&id, &admin.id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Usuario no encontrado".to_string()))
    }
}

// ========== Audits ==========

async fn list_audits_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<Audit>>, AppError> {
    Ok(Json(state.audits.list(&query)?))
}

async fn create_audit_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    payload: Result<Json<NewAudit>, JsonRejection>,
) -> Result<(StatusCode, Json<Audit>), AppError> {
    let Json(form) = payload?;
    let audit = form
        .into_audit(&user.username, chrono::Utc::now())
        .map_err(AppError::Validation)?;

    state.audits.create(&audit)?;
    info!(
        id = %audit.id,
        document = %audit.document_number,
        visit_type = %audit.visit_type,
        auditor = %audit.auditor,
        "Audit recorded"
    );
    Ok((StatusCode::CREATED, Json(audit)))
}

async fn get_audit_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Audit>, AppError> {
    state
        .audits
        .get(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Auditoría no encontrada".to_string()))
}

async fn delete_audit_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    if state.audits.delete(&id)? {
        info!(id = %id, by = %user.username, "Audit deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Auditoría no encontrada".to_string()))
    }
}

async fn export_audits_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
) -> Result<Response, AppError> {
    let audits = state.audits.list(&AuditQuery::default())?;
    let body = export::audits_csv(&audits)?;
    Ok(csv_response("auditorias.csv", body))
}

// ========== Extracts ==========

async fn list_extracts_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
) -> Json<Vec<ExtractInfo>> {
    Json(state.extracts.read().await.clone())
}

async fn refresh_extracts_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<ExtractInfo>>, AppError> {
    let count = refresh_extracts(&state).await?;
    info!(count = count, by = %user.username, "Manual extract refresh");
    Ok(Json(state.extracts.read().await.clone()))
}

async fn upload_extract_handler(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ExtractInfo>), AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await?;

        let dir = state.extracts_dir.clone();
        let saved = tokio::task::spawn_blocking(move || extracts::save_upload(&dir, &file_name, &bytes))
            .await
            .context("Extract upload task failed")??;

        refresh_extracts(&state).await?;
        info!(name = %saved.name, by = %user.username, "Extract stored");
        return Ok((StatusCode::CREATED, Json(saved)));
    }

    Err(AppError::Validation(
        "Debe adjuntar un archivo en el campo 'file'".to_string(),
    ))
}

async fn delete_extract_handler(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    if !extracts::remove(&state.extracts_dir, &name)? {
        return Err(AppError::NotFound("Extracto no encontrado".to_string()));
    }
    refresh_extracts(&state).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn kpi_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Path(name): Path<String>,
    Query(filter): Query<Filter>,
) -> Result<Json<KpiReport>, AppError> {
    Ok(Json(load_report(&state, name, filter).await?))
}

async fn kpi_csv_handler(
    State(state): State<Arc<AppState>>,
    _user: CurrentUser,
    Path(name): Path<String>,
    Query(filter): Query<Filter>,
) -> Result<Response, AppError> {
    let report = load_report(&state, name, filter).await?;
    let stem = report
        .source
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&report.source);
    let body = export::kpi_csv(&report)?;
    Ok(csv_response(&format!("indicadores_{}.csv", stem), body))
}
