// HTTP request handlers for API endpoints

use actix_web::{web, HttpResponse, Result};
use std::time::SystemTime;

use crate::api::models::*;
use crate::sync::{Marketplace, SyncContext};

/// Health check endpoint
pub async fn health_check(ctx: web::Data<SyncContext>) -> Result<HttpResponse> {
    // Quick database connectivity check
    let db_status = match sqlx::query_scalar::<_, bool>("SELECT true")
        .fetch_one(&ctx.db.pool)
        .await
    {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    let uptime = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: db_status.to_string(),
        uptime_seconds: uptime,
    });

    Ok(HttpResponse::Ok().json(response))
}

fn start_product_sync(ctx: &SyncContext, market: Marketplace) -> HttpResponse {
    tracing::info!(marketplace = %market, "product sync requested");
    match ctx.spawn_product_sync(market) {
        Ok(sync_id) => HttpResponse::Accepted().json(ApiResponse::success(SyncStartResponse {
            sync_id,
            provider: market.as_str().to_string(),
            resource: "products".to_string(),
        })),
        Err(conflict) => {
            HttpResponse::Conflict().json(ApiResponse::<()>::error(conflict.to_string()))
        }
    }
}

/// Kick off the Etsy product sync
pub async fn sync_etsy_products(ctx: web::Data<SyncContext>) -> Result<HttpResponse> {
    Ok(start_product_sync(&ctx, Marketplace::Etsy))
}

/// Kick off the Shopify product sync (bulk export path)
pub async fn sync_shopify_products(ctx: web::Data<SyncContext>) -> Result<HttpResponse> {
    Ok(start_product_sync(&ctx, Marketplace::Shopify))
}

/// Dispatch an order sync for the marketplace named in the query string
pub async fn sync_orders(
    ctx: web::Data<SyncContext>,
    query: web::Query<OrderSyncQuery>,
) -> Result<HttpResponse> {
    let market: Marketplace = match query.marketplace.parse() {
        Ok(m) => m,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string())))
        }
    };
    tracing::info!(marketplace = %market, "order sync requested");

    match ctx.spawn_order_sync(market) {
        Ok(sync_id) => Ok(HttpResponse::Accepted().json(ApiResponse::success(
            SyncStartResponse {
                sync_id,
                provider: market.as_str().to_string(),
                resource: "orders".to_string(),
            },
        ))),
        Err(conflict) => {
            Ok(HttpResponse::Conflict().json(ApiResponse::<()>::error(conflict.to_string())))
        }
    }
}

/// Poll one sync operation. Unknown or expired ids return a zeroed default
/// snapshot rather than a 404, so pollers can treat the endpoint as total.
pub async fn get_sync_status(
    ctx: web::Data<SyncContext>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let sync_id = path.into_inner();
    let snapshot = ctx.registry.get(&sync_id);
    let response = ApiResponse::success(SyncStatusResponse::from(snapshot));
    Ok(HttpResponse::Ok().json(response))
}

/// List currently running sync operations
pub async fn list_active_syncs(ctx: web::Data<SyncContext>) -> Result<HttpResponse> {
    let running: Vec<SyncStatusResponse> = ctx
        .registry
        .active()
        .into_iter()
        .map(SyncStatusResponse::from)
        .collect();
    Ok(HttpResponse::Ok().json(ApiResponse::success(running)))
}
