use actix_web::{web, HttpResponse, Responder};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::error;

use crate::engine::WheelEngine;

/// Shared state behind the HTTP surface. `cycle_gate` is the process-wide
/// mutex: at most one of scan/run/monitor is in flight at any moment.
/// `/health` never takes it.
pub struct ApiState {
    pub engine: Arc<WheelEngine>,
    pub cycle_gate: Arc<Mutex<()>>,
    pub cycle_timeout: Duration,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Run one cycle under the gate with the request budget applied. On
/// timeout the spawned cycle keeps running to completion (aborting
/// mid-batch could strand a half-submitted order sequence) and the
/// caller gets a 504.
async fn run_gated<F, Fut, T>(state: &ApiState, cycle: F) -> HttpResponse
where
    F: FnOnce(Arc<WheelEngine>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let engine = state.engine.clone();
    let gate = state.cycle_gate.clone();

    let handle = tokio::spawn(async move {
        let _guard = gate.lock().await;
        cycle(engine).await
    });

    match tokio::time::timeout(state.cycle_timeout, handle).await {
        Ok(Ok(Ok(response))) => HttpResponse::Ok().json(response),
        Ok(Ok(Err(message))) => {
            error!(message = %message, "cycle failed");
            HttpResponse::InternalServerError().json(ErrorResponse { error: message })
        }
        Ok(Err(join_error)) => {
            error!(error = %join_error, "cycle task panicked");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "cycle task failed".to_string(),
            })
        }
        Err(_) => HttpResponse::GatewayTimeout().json(ErrorResponse {
            error: "cycle still running, request budget exceeded".to_string(),
        }),
    }
}

async fn scan(state: web::Data<ApiState>) -> impl Responder {
    run_gated(&state, |engine| async move { Ok(engine.scan().await) }).await
}

async fn run(state: web::Data<ApiState>) -> impl Responder {
    run_gated(&state, |engine| async move {
        engine.run().await.map_err(|e| e.to_string())
    })
    .await
}

async fn monitor(state: web::Data<ApiState>) -> impl Responder {
    run_gated(&state, |engine| async move { Ok(engine.monitor().await) }).await
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health_check)))
        .service(web::resource("/scan").route(web::post().to(scan)))
        .service(web::resource("/run").route(web::post().to(run)))
        .service(web::resource("/monitor").route(web::post().to(monitor)));
}
