// API route configuration

use actix_web::web;

use crate::api::handlers;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        // Sync triggers and status polling (authenticated)
        .service(
            web::scope("/sync")
                .route("/sync-etsy", web::post().to(handlers::sync_etsy_products))
                .route(
                    "/sync-shopify",
                    web::post().to(handlers::sync_shopify_products),
                )
                .route("/sync-orders", web::get().to(handlers::sync_orders))
                .route("/status", web::get().to(handlers::list_active_syncs))
                .route("/status/{sync_id}", web::get().to(handlers::get_sync_status)),
        );
}
