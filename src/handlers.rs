use actix_web::{web, HttpResponse};
use log::debug;
use std::sync::Arc;
use validator::Validate;

use crate::challenge::{Challenge, ChallengeTiming};
use crate::context::BlobberContext;
use crate::error::BlobberError;
use crate::models::{HealthResponse, LockRequest, TimingsQuery};
use crate::writemarker::WriteMarkerEntity;

pub type Ctx = web::Data<Arc<BlobberContext>>;

// Liveness plus a little state
pub async fn healthcheck(ctx: Ctx) -> Result<HttpResponse, BlobberError> {
    Ok(HttpResponse::Ok().json(HealthResponse {
        blobber_id: ctx.blobber_id().to_string(),
        volumes: ctx.balancer.volumes().len(),
        challenges_in_flight: ctx.challenge_status.len(),
    }))
}

// Persisted challenge by ID
pub async fn get_challenge(
    ctx: Ctx,
    path: web::Path<String>,
) -> Result<HttpResponse, BlobberError> {
    let challenge_id = path.into_inner();
    let challenge = Challenge::get(&ctx.db.begin(), &challenge_id)?
        .ok_or_else(|| BlobberError::NotFound(format!("challenge {}", challenge_id)))?;
    Ok(HttpResponse::Ok().json(challenge))
}

// Most recently closed challenge timings
pub async fn get_challenge_timings(
    ctx: Ctx,
    query: web::Query<TimingsQuery>,
) -> Result<HttpResponse, BlobberError> {
    query.validate()?;
    let timings = ChallengeTiming::recent_closed(&ctx.db.begin(), query.limit())?;
    Ok(HttpResponse::Ok().json(timings))
}

// Write-marker ledger of an allocation, in sequence order
pub async fn get_write_markers(
    ctx: Ctx,
    path: web::Path<String>,
) -> Result<HttpResponse, BlobberError> {
    let markers = WriteMarkerEntity::list(&ctx.db.begin(), &path.into_inner())?;
    Ok(HttpResponse::Ok().json(markers))
}

pub async fn lock_allocation(
    ctx: Ctx,
    payload: web::Json<LockRequest>,
) -> Result<HttpResponse, BlobberError> {
    payload.validate()?;
    let result = ctx
        .write_lock
        .lock(&payload.allocation_id, &payload.connection_id)
        .await?;
    debug!(
        "Lock request for {} by {}: {:?}",
        payload.allocation_id, payload.connection_id, result.status
    );
    Ok(HttpResponse::Ok().json(result))
}

pub async fn unlock_allocation(
    ctx: Ctx,
    payload: web::Json<LockRequest>,
) -> Result<HttpResponse, BlobberError> {
    payload.validate()?;
    ctx.write_lock
        .unlock(&payload.allocation_id, &payload.connection_id)
        .await?;
    Ok(HttpResponse::Ok().finish())
}

pub async fn get_volumes(ctx: Ctx) -> Result<HttpResponse, BlobberError> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "strategy": ctx.balancer.strategy_name(),
        "volumes": ctx.balancer.volumes(),
    })))
}

/// Registers every route of the operational surface.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/_healthcheck", web::get().to(healthcheck)).service(
        web::scope("/v1")
            .route("/challenge/timings", web::get().to(get_challenge_timings))
            .route("/challenge/{id}", web::get().to(get_challenge))
            .route("/writemarker/lock", web::post().to(lock_allocation))
            .route("/writemarker/lock", web::delete().to(unlock_allocation))
            .route("/writemarker/{allocation_id}", web::get().to(get_write_markers))
            .route("/volumes", web::get().to(get_volumes)),
    );
}
