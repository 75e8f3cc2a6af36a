// src/main.rs

use anyhow::{Context, Result};
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod invoice_math;
mod models;
mod policy;
mod timesheet_system;
mod work_hours;

use models::{InvoiceId, InvoiceStatus, Principal, ProjectId, Timesheet, TimesheetId, UserId};
use timesheet_system::{
    Clock, CoreError, CreateInvoice, NewProject, NewTimesheet, NewUser, ProjectPatch,
    StoreCounters, TimesheetPatch, TimesheetSystem, UserPatch,
};
use work_hours::WorkingWindow;

// --- Configuration ---

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_window_start() -> String {
    work_hours::DEFAULT_WINDOW_START.to_string()
}

fn default_window_end() -> String {
    work_hours::DEFAULT_WINDOW_END.to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    #[serde(default = "default_bind_addr")]
    bind_addr: String,
    #[serde(default = "default_window_start")]
    work_window_start: String,
    #[serde(default = "default_window_end")]
    work_window_end: String,
}

/// Contractor timesheet and invoicing service.
#[derive(Parser, Debug)]
#[command(name = "crewtime", version, about)]
struct Cli {
    /// Listen address, overriding BIND_ADDR from the environment.
    #[arg(long)]
    bind: Option<String>,
    /// Load a small demo data set (users and projects) at startup.
    #[arg(long)]
    seed_demo: bool,
}

// --- Error mapping ---

#[derive(Error, Debug)]
pub enum AppError {
    #[error("authentication required")]
    Unauthenticated,
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "Authentication required.".to_string(),
            ),
            AppError::Core(core) => match core {
                CoreError::Validation(_) => (StatusCode::BAD_REQUEST, core.to_string()),
                CoreError::Authorization(_) => (StatusCode::FORBIDDEN, core.to_string()),
                CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, core.to_string()),
                CoreError::Conflict(_) => (StatusCode::CONFLICT, core.to_string()),
                CoreError::Persistence(detail) => {
                    // Do not leak storage internals to the caller.
                    error!("Storage failure: {}", detail);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error.".to_string(),
                    )
                }
            },
        };
        if status.is_client_error() {
            warn!("Request rejected ({}): {}", status, message);
        }
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

// --- Request identity ---

/// The identity/session provider lives in front of this service; it passes
/// the authenticated principal down as headers. Requests without both
/// headers are rejected before any handler runs.
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<UserId>().ok());
        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        match (user_id, role) {
            (Some(user_id), Some(role)) => Ok(Principal { user_id, role }),
            _ => Err(AppError::Unauthenticated),
        }
    }
}

#[derive(Clone)]
struct AppState {
    system: Arc<TimesheetSystem>,
}

// --- Handlers (thin adapters over the system) ---

#[derive(Debug, Deserialize)]
struct WeekQuery {
    date: chrono::NaiveDate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovedQuery {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct InvoiceStatusUpdate {
    status: InvoiceStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WeekLookup {
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timesheet: Option<Timesheet>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceDetail {
    #[serde(flatten)]
    invoice: models::Invoice,
    timesheet_ids: Vec<TimesheetId>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
    time: String,
    counters: StoreCounters,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        status: "ok",
        time: chrono::Local::now().to_rfc3339(),
        counters: state.system.counters(),
    })
}

async fn handle_create_timesheet(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<NewTimesheet>,
) -> Result<impl IntoResponse, AppError> {
    let sheet = state.system.create_timesheet(&principal, req)?;
    Ok((StatusCode::CREATED, Json(sheet)))
}

async fn handle_list_own_timesheets(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<Timesheet>>, AppError> {
    Ok(Json(state.system.list_own_timesheets(&principal)?))
}

async fn handle_find_week(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<WeekQuery>,
) -> Result<Json<WeekLookup>, AppError> {
    let timesheet = state.system.find_week_timesheet(&principal, query.date)?;
    Ok(Json(WeekLookup {
        exists: timesheet.is_some(),
        timesheet,
    }))
}

async fn handle_update_timesheet(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<TimesheetId>,
    Json(patch): Json<TimesheetPatch>,
) -> Result<Json<Timesheet>, AppError> {
    Ok(Json(state.system.update_timesheet(&principal, id, patch)?))
}

async fn handle_delete_timesheet(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<TimesheetId>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.system.delete_timesheet(&principal, id)?;
    Ok(Json(
        serde_json::json!({ "message": "Timesheet deleted successfully" }),
    ))
}

async fn handle_all_timesheets(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<Timesheet>>, AppError> {
    Ok(Json(state.system.list_all_timesheets(&principal)?))
}

async fn handle_approved_timesheets(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<ApprovedQuery>,
) -> Result<Json<Vec<Timesheet>>, AppError> {
    Ok(Json(
        state
            .system
            .list_approved_for_user(&principal, query.user_id)?,
    ))
}

async fn handle_create_invoice(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<CreateInvoice>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state.system.create_invoice(&principal, req)?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn handle_list_invoices(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<models::Invoice>>, AppError> {
    Ok(Json(state.system.list_invoices(&principal)?))
}

async fn handle_get_invoice(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<InvoiceId>,
) -> Result<Json<InvoiceDetail>, AppError> {
    let (invoice, timesheet_ids) = state.system.get_invoice(&principal, id)?;
    Ok(Json(InvoiceDetail {
        invoice,
        timesheet_ids,
    }))
}

async fn handle_set_invoice_status(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<InvoiceId>,
    Json(update): Json<InvoiceStatusUpdate>,
) -> Result<Json<models::Invoice>, AppError> {
    Ok(Json(
        state
            .system
            .set_invoice_status(&principal, id, update.status)?,
    ))
}

async fn handle_list_users(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<timesheet_system::UserSummary>>, AppError> {
    Ok(Json(state.system.list_users(&principal)?))
}

async fn handle_create_user(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<NewUser>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.system.create_user(&principal, req)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn handle_get_user(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<UserId>,
) -> Result<Json<models::User>, AppError> {
    Ok(Json(state.system.get_user(&principal, id)?))
}

async fn handle_update_user(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<UserId>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<models::User>, AppError> {
    Ok(Json(state.system.update_user(&principal, id, patch)?))
}

async fn handle_list_projects(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<models::Project>>, AppError> {
    Ok(Json(state.system.list_projects(&principal)?))
}

async fn handle_create_project(
    State(state): State<AppState>,
    principal: Principal,
    Json(req): Json<NewProject>,
) -> Result<impl IntoResponse, AppError> {
    let project = state.system.create_project(&principal, req)?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn handle_update_project(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<ProjectId>,
    Json(patch): Json<ProjectPatch>,
) -> Result<Json<models::Project>, AppError> {
    Ok(Json(state.system.update_project(&principal, id, patch)?))
}

async fn handle_delete_project(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<ProjectId>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.system.delete_project(&principal, id)?;
    Ok(Json(
        serde_json::json!({ "message": "Project deleted successfully" }),
    ))
}

fn router(state: AppState) -> Router {
    let timesheet_routes = Router::new()
        .route(
            "/",
            post(handle_create_timesheet).get(handle_list_own_timesheets),
        )
        .route("/week", get(handle_find_week))
        .route(
            "/{id}",
            put(handle_update_timesheet).delete(handle_delete_timesheet),
        );
    let invoicing_routes = Router::new()
        .route("/timesheets", get(handle_approved_timesheets))
        .route("/create", post(handle_create_invoice));
    let admin_routes = Router::new()
        .route("/timesheets", get(handle_all_timesheets))
        .route("/invoices", get(handle_list_invoices))
        .route(
            "/invoices/{id}",
            get(handle_get_invoice).put(handle_set_invoice_status),
        );
    let user_routes = Router::new()
        .route("/", get(handle_list_users).post(handle_create_user))
        .route("/{id}", get(handle_get_user).put(handle_update_user));
    let project_routes = Router::new()
        .route("/", get(handle_list_projects).post(handle_create_project))
        .route(
            "/{id}",
            put(handle_update_project).delete(handle_delete_project),
        );

    Router::new()
        .nest("/api/timesheets", timesheet_routes)
        .nest("/api/invoicing", invoicing_routes)
        .nest("/api/admin", admin_routes)
        .nest("/api/users", user_routes)
        .nest("/api/projects", project_routes)
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: AppConfig =
        envy::from_env().context("Reading configuration from environment failed")?;
    let window = WorkingWindow::parse(&config.work_window_start, &config.work_window_end)
        .context("Invalid working window configuration")?;
    info!(
        "Normal working window: {} - {}",
        window.start().format("%H:%M"),
        window.end().format("%H:%M")
    );

    let system = Arc::new(TimesheetSystem::new(Clock::System, window));
    if cli.seed_demo {
        system.seed_demo();
    }

    let app = router(AppState { system });

    let bind = cli.bind.unwrap_or(config.bind_addr);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid listen address '{}'", bind))?;
    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Binding {} failed", addr))?;
    axum::serve(listener, app)
        .await
        .context("HTTP server failed")?;

    Ok(())
}
