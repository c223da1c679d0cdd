// HTTP API server binary for marketsync.
// Exposes the sync triggers and status polling endpoints.

use anyhow::Result;

use marketsync::api::server::ApiServer;
use marketsync::store::db::Db;
use marketsync::sync::SyncContext;
use marketsync::util::env::{db_url, env_parse, init_env};
use marketsync::util::tracing::init_tracing;

#[actix_web::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("info,sqlx=warn")?;

    tracing::info!("Initializing marketsync API server");

    // Load configuration before touching the network so a bad setup fails fast
    let server = ApiServer::from_env()?;

    let db = Db::connect(&db_url()?, env_parse("DB_MAX_CONNS", 10u32)).await?;
    let ctx = SyncContext::from_env(db)?;

    // Background expiry of finished sync records
    ctx.registry.spawn_sweeper();

    server.run(ctx).await
}
