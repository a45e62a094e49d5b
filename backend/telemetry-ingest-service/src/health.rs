//! Liveness, readiness and Prometheus endpoints

use actix_web::{web, HttpResponse};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;

use crate::services::PipelineState;

/// Shared by every HTTP worker
#[derive(Clone)]
pub struct HealthState {
    pipeline: watch::Receiver<PipelineState>,
    registry: Registry,
}

impl HealthState {
    pub fn new(pipeline: watch::Receiver<PipelineState>, registry: Registry) -> Self {
        Self { pipeline, registry }
    }
}

#[derive(Debug, Serialize)]
struct Readiness {
    ready: bool,
    state: &'static str,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(metrics));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

/// 200 only while batches are being processed
async fn ready(state: web::Data<HealthState>) -> HttpResponse {
    let pipeline = *state.pipeline.borrow();
    let body = Readiness {
        ready: pipeline == PipelineState::Running,
        state: pipeline.as_str(),
    };

    if body.ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn metrics(state: web::Data<HealthState>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
