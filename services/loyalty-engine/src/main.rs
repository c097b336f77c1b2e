use actix_web::{middleware, web, App, HttpServer};
use anyhow::{anyhow, Context};
use clap::Parser;
use dotenv::dotenv;
use loyalty_core::{LoyaltyService, Reconciler};
use loyalty_engine::{
    accounts::AccountService, accrual_client::AccrualClient, auth::SessionKeys,
    config::{CliArgs, Config},
    database::Database, handlers,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .with_target(false)
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::load(&args).context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    init_tracing(&config);

    info!("Starting Loyalty Engine on {}", config.server.address);

    let db = Arc::new(
        Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .context("Failed to connect to database")?,
    );
    db.migrate().await.context("Failed to apply database schema")?;

    let oracle = Arc::new(
        AccrualClient::new(&config.accrual.base_url, config.accrual.timeout_secs)
            .context("Failed to create accrual client")?,
    );

    let reconciler = Reconciler::new(db.clone(), oracle, config.accrual.reconciler())
        .spawn(CancellationToken::new());

    let service = web::Data::new(LoyaltyService::with_ledger(db.clone()));
    let accounts = web::Data::new(AccountService::new(db.clone()));
    let keys = web::Data::new(SessionKeys::new(
        &config.auth.jwt_secret,
        config.auth.session_ttl_hours,
    ));

    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(service.clone())
            .app_data(accounts.clone())
            .app_data(keys.clone())
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .shutdown_timeout(config.server.shutdown_timeout_secs)
    .bind(config.server.address.as_str())
    .with_context(|| format!("Failed to bind {}", config.server.address))?
    .run();

    let result = server.await;

    info!("HTTP server stopped, waiting for reconciler");
    if tokio::time::timeout(Duration::from_secs(config.server.shutdown_timeout_secs), reconciler.shutdown())
        .await
        .is_err()
    {
        warn!("Reconciler did not stop within the shutdown timeout");
    }

    result.context("HTTP server failed")
}
