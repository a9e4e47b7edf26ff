//! SNAP gateway binary: bank callbacks plus the outbound client

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use snap_client::cache::RedisCache;
use snap_client::database::{self, PgReservationStore};
use snap_client::server::{self, AppState};
use snap_client::store::SnapCache;
use snap_client::virtual_account::VirtualAccountService;
use snap_client::{Config, ExpiryWatcher, InboundVerifier, SignatureEngine, SnapClient, SnapSession};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("snap_client=info,snap_gateway=info,actix_web=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting SNAP gateway...");

    let config = Config::from_env().context("loading configuration")?;
    config.validate().context("validating configuration")?;
    info!("Configuration loaded for bank {}", config.bank.base_url);

    // Keys are loaded once, up front; a bad path stops startup here
    let signer = Arc::new(
        SignatureEngine::from_config(&config.bank, &config.signing).context("loading signing keys")?,
    );

    let pool = database::create_pool(&config.database)
        .await
        .context("connecting to database")?;
    database::run_migrations(&pool)
        .await
        .context("applying migrations")?;
    let store = Arc::new(PgReservationStore::new(pool));

    let redis = RedisCache::connect(&config.redis.url)
        .await
        .context("connecting to Redis")?;
    let cache = SnapCache::new(Arc::new(redis));

    let client = SnapClient::new(&config.bank, signer.clone()).context("building SNAP client")?;
    let session = Arc::new(SnapSession::new(Arc::new(client), &config.token));

    let watcher = ExpiryWatcher::new(store.clone(), &config.watcher);
    watcher
        .restore_pending()
        .await
        .context("restoring pending expiries")?;
    let accounts = Arc::new(VirtualAccountService::new(
        session,
        store,
        watcher.clone(),
        &config.bank.partner_id,
        &config.watcher,
    ));
    let verifier = Arc::new(InboundVerifier::new(signer, cache, &config.inbound));
    let state = web::Data::new(AppState { verifier, accounts });

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(state.clone())
            .configure(server::configure)
    })
    .bind(&bind_address)
    .with_context(|| format!("binding {}", bind_address))?
    .run()
    .await?;

    watcher.shutdown();
    info!("SNAP gateway stopped");
    Ok(())
}
