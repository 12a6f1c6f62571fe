use crate::errors::CreditTrackerError;
use crate::ledger::Ledger;
use crate::metrics;
use crate::models::{
    BalanceResponse, ConfirmGrantRequest, CreateGrantRequest, DeductRequest, OperationResponse,
    RefundRequest,
};
use crate::services::CreditService;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use validator::Validate;

/// Health check endpoint
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "credit-tracker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Deduct credits, minting more via an automatic burn when needed
pub async fn deduct_credits(
    service: web::Data<Arc<CreditService>>,
    request: web::Json<DeductRequest>,
) -> Result<HttpResponse, CreditTrackerError> {
    let request = request.into_inner();
    request
        .validate()
        .map_err(|e| CreditTrackerError::Validation(e.to_string()))?;

    let operation = service
        .deduct_with_auto_burn(
            &request.license_id,
            &request.asset_did,
            request.amount,
            &request.app_name,
            &request.reference_id,
        )
        .await?;

    Ok(HttpResponse::Ok().json(OperationResponse::from(operation)))
}

/// Refund a prior deduction
pub async fn refund_credits(
    service: web::Data<Arc<CreditService>>,
    request: web::Json<RefundRequest>,
) -> Result<HttpResponse, CreditTrackerError> {
    let request = request.into_inner();
    request
        .validate()
        .map_err(|e| CreditTrackerError::Validation(e.to_string()))?;

    let operation = service
        .refund(&request.app_name, &request.reference_id)
        .await?;

    Ok(HttpResponse::Ok().json(OperationResponse::from(operation)))
}

// Asset DIDs contain path separators, so balance lookups take query params.
#[derive(serde::Deserialize)]
pub struct BalanceQuery {
    license_id: String,
    asset_did: String,
}

/// Get the signed balance for a license/asset; negative means debt
pub async fn get_balance(
    service: web::Data<Arc<CreditService>>,
    query: web::Query<BalanceQuery>,
) -> Result<HttpResponse, CreditTrackerError> {
    let remaining_credits = service
        .get_balance(&query.license_id, &query.asset_did)
        .await?;

    Ok(HttpResponse::Ok().json(BalanceResponse {
        license_id: query.license_id.clone(),
        asset_did: query.asset_did.clone(),
        remaining_credits,
    }))
}

/// Register a pending grant for an initiated burn transaction
pub async fn create_grant(
    ledger: web::Data<Arc<Ledger>>,
    request: web::Json<CreateGrantRequest>,
) -> Result<HttpResponse, CreditTrackerError> {
    let request = request.into_inner();
    request
        .validate()
        .map_err(|e| CreditTrackerError::Validation(e.to_string()))?;

    let operation = ledger
        .create_grant(
            &request.license_id,
            &request.asset_did,
            request.amount,
            &request.tx_hash,
            request.mint_time,
        )
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "grant_id": operation.reference_id,
        "operation": OperationResponse::from(operation)
    })))
}

/// Confirm a grant from an observed on-chain burn
pub async fn confirm_grant(
    ledger: web::Data<Arc<Ledger>>,
    request: web::Json<ConfirmGrantRequest>,
) -> Result<HttpResponse, CreditTrackerError> {
    let request = request.into_inner();
    request
        .validate()
        .map_err(|e| CreditTrackerError::Validation(e.to_string()))?;

    let operation = ledger
        .confirm_grant(
            &request.license_id,
            &request.asset_did,
            &request.tx_hash,
            request.log_index,
            request.amount,
            request.mint_time,
        )
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "grant_id": operation.reference_id,
        "operation": OperationResponse::from(operation)
    })))
}

#[derive(serde::Deserialize)]
pub struct ReportQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// Usage report for a license across all assets
pub async fn license_usage_report(
    ledger: web::Data<Arc<Ledger>>,
    license_id: web::Path<String>,
    query: web::Query<ReportQuery>,
) -> Result<HttpResponse, CreditTrackerError> {
    let report = ledger
        .license_usage_report(&license_id, query.from, query.to)
        .await?;

    Ok(HttpResponse::Ok().json(report))
}

#[derive(serde::Deserialize)]
pub struct AssetReportQuery {
    asset_did: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// Usage report for a single license/asset pair
pub async fn license_asset_usage_report(
    ledger: web::Data<Arc<Ledger>>,
    license_id: web::Path<String>,
    query: web::Query<AssetReportQuery>,
) -> Result<HttpResponse, CreditTrackerError> {
    let report = ledger
        .license_asset_usage_report(&license_id, &query.asset_did, query.from, query.to)
        .await?;

    Ok(HttpResponse::Ok().json(report))
}

/// Prometheus metrics endpoint
pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().json(json!({
            "error": "Failed to gather metrics",
            "details": e.to_string()
        })),
    }
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/credits/deduct", web::post().to(deduct_credits))
            .route("/credits/refund", web::post().to(refund_credits))
            .route("/credits/balance", web::get().to(get_balance))
            .route("/grants", web::post().to(create_grant))
            .route("/grants/confirm", web::post().to(confirm_grant))
            .route(
                "/reports/licenses/{license_id}/usage",
                web::get().to(license_usage_report),
            )
            .route(
                "/reports/licenses/{license_id}/assets/usage",
                web::get().to(license_asset_usage_report),
            ),
    )
    .route("/metrics", web::get().to(metrics_endpoint))
    .route("/health", web::get().to(health_check));
}
