use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ticketpal::{
    auth::jwt::JwtService, automation::AutomationServices, config::AppConfig, db,
    default_handlers, s3::build_client, state::AppState, storage::S3Storage, Worker,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        recipe_execution = ?config.recipe_execution,
        browser_headless = config.browser_headless,
        text_generation = config.openai_api_key.is_some(),
        settle_timeout_secs = config.portal_settle_timeout_secs,
        "loaded worker configuration"
    );

    // One connection for the queue, one for evidence writes during a run.
    let pool = db::init_pool_with_size(&config.database_url, 2)?;
    let storage = Arc::new(S3Storage::new(
        build_client(&config).await?,
        config.s3_bucket.clone(),
    ));
    let jwt = JwtService::from_config(&config).context("invalid JWT configuration")?;
    let automation = AutomationServices::from_config(&config);
    let state = Arc::new(AppState::new(pool, config, storage, jwt, automation));

    let worker = Worker::new(state, default_handlers(), POLL_INTERVAL);
    worker
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; finishing the current job");
            }
        })
        .await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
