use actix_web::{web, HttpResponse, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::BrokerError;
use crate::config::{ParamStore, TradingParams};
use crate::metrics;
use crate::model::{Alert, AlertPayload};
use crate::pipeline::ExecutionPipeline;
use crate::scheduler::Supervisor;
use crate::session::SessionManager;
use crate::storage::FileStorage;

/// Shared handler state, built once in `main`.
pub struct AppState {
    pub pipeline: Arc<ExecutionPipeline>,
    pub session: Arc<SessionManager>,
    pub supervisor: Arc<Supervisor>,
    pub params: Arc<ParamStore>,
    pub storage: Arc<FileStorage>,
    /// Broker login page the operator is sent to.
    pub login_url: String,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/webhook", web::post().to(webhook))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_endpoint))
        .route("/auth/login", web::get().to(auth_login))
        .route("/auth/redirect", web::get().to(auth_redirect))
        .route("/auth/status", web::get().to(auth_status))
        .route("/settings", web::get().to(get_settings))
        .route("/settings", web::post().to(update_settings));
}

/// Scanner webhook. Refused outright while the market lifecycle is in
/// minimal mode; the scanner retries on its side.
async fn webhook(
    state: web::Data<AppState>,
    payload: web::Json<AlertPayload>,
) -> impl Responder {
    if !state.supervisor.accepting_alerts() {
        return HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "error",
            "error": "market closed, alerts are not being executed",
        }));
    }

    metrics::ALERTS_RECEIVED.inc();
    let alert = match Alert::from_payload(payload.into_inner()) {
        Ok(alert) => alert,
        Err(e) => {
            warn!("Rejected malformed alert: {}", e);
            metrics::ALERTS_REJECTED.inc();
            return HttpResponse::BadRequest().json(serde_json::json!({
                "status": "error",
                "error": e.to_string(),
            }));
        }
    };

    let result = state.pipeline.execute_alert(&alert).await;
    // Expiry may have tripped mid-alert; deliver its notification promptly
    state.session.flush_notifications().await;

    match result {
        Ok(report) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "report": report,
        })),
        Err(BrokerError::TradingDisabled) => {
            HttpResponse::ServiceUnavailable().json(serde_json::json!({
                "status": "error",
                "error": "trading disabled, login required",
            }))
        }
        Err(e) => {
            warn!("Alert execution failed: {}", e);
            HttpResponse::BadGateway().json(serde_json::json!({
                "status": "error",
                "error": e.to_string(),
            }))
        }
    }
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "mode": state.supervisor.mode(),
        "trading_enabled": state.session.is_trading_enabled(),
    }))
}

async fn metrics_endpoint() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

/// Start of the operator login flow: bounce to the broker's login page.
async fn auth_login(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Found()
        .append_header(("Location", state.login_url.clone()))
        .finish()
}

#[derive(Deserialize)]
struct AuthRedirectQuery {
    request_token: Option<String>,
    status: Option<String>,
}

/// Broker redirect target. Completes the token exchange and reports the new
/// session's expiry.
async fn auth_redirect(
    state: web::Data<AppState>,
    query: web::Query<AuthRedirectQuery>,
) -> impl Responder {
    if query.status.as_deref() == Some("error") {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "error": "broker reported a failed login",
        }));
    }
    let Some(request_token) = query.request_token.as_deref() else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "status": "error",
            "error": "missing request_token",
        }));
    };

    match state.session.complete_login(request_token).await {
        Ok(credential) => {
            state.session.flush_notifications().await;
            HttpResponse::Ok().json(serde_json::json!({
                "status": "ok",
                "user": credential.display_name,
                "expires_at": credential.expires_at.to_rfc3339(),
            }))
        }
        Err(e) => {
            warn!("Login exchange failed: {}", e);
            HttpResponse::Unauthorized().json(serde_json::json!({
                "status": "error",
                "error": e.to_string(),
            }))
        }
    }
}

async fn auth_status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.session.status())
}

async fn get_settings(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.params.snapshot())
}

/// Replace the runtime trading parameters and persist them, so the next
/// alert picks them up without a restart.
async fn update_settings(
    state: web::Data<AppState>,
    body: web::Json<TradingParams>,
) -> impl Responder {
    let params = body.into_inner();
    if let Err(e) = state.storage.save_settings(&params) {
        warn!("Failed to persist settings: {}", e);
    }
    info!(?params, "Trading parameters updated");
    state.params.replace(params.clone());
    HttpResponse::Ok().json(params)
}
