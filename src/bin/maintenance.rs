use std::env;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tracing_subscriber::EnvFilter;

use ticketpal::{
    auth::jwt::JwtService,
    automation::{challenges::sweep_orphans, dispatch, AutomationServices, ChallengeReason, Intent},
    config::AppConfig,
    db, s3,
    state::AppState,
    storage::S3Storage,
};

const USAGE: &str = "Usage: maintenance verify <PCN>\n       maintenance challenge <PCN> <REASON>\n       maintenance sweep-orphans [minutes]";
const DEFAULT_ORPHAN_MINUTES: i64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["verify", pcn] => run_script(pcn, Intent::Verify, None).await?,
        ["challenge", pcn, reason] => {
            let reason: ChallengeReason = reason.parse()?;
            run_script(pcn, Intent::Challenge, Some(reason)).await?
        }
        ["sweep-orphans"] => sweep(DEFAULT_ORPHAN_MINUTES).await?,
        ["sweep-orphans", minutes] => {
            let minutes = minutes
                .parse()
                .context("sweep-orphans expects a number of minutes")?;
            sweep(minutes).await?
        }
        [cmd, ..] => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        [] => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn load_state() -> Result<AppState> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        "loaded backend configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
    let s3_client = s3::build_client(&config).await?;
    let storage = Arc::new(S3Storage::new(s3_client, config.s3_bucket.clone()));
    let jwt = JwtService::from_config(&config)?;
    let automation = AutomationServices::from_config(&config);
    Ok(AppState::new(pool, config, storage, jwt, automation))
}

async fn run_script(pcn: &str, intent: Intent, reason: Option<ChallengeReason>) -> Result<()> {
    let state = load_state().await?;
    let report = dispatch(&state, pcn, intent, reason, None)
        .await
        .with_context(|| format!("{intent} run for {pcn} failed"))?;

    println!("{intent} completed for {pcn}: {} steps", report.completed_steps());
    let mut captured: Vec<_> = report.captured.iter().collect();
    captured.sort();
    for (name, value) in captured {
        println!("  {name}: {value}");
    }
    for url in report.evidence_urls() {
        println!("  evidence: {url}");
    }
    Ok(())
}

async fn sweep(minutes: i64) -> Result<()> {
    if minutes < 0 {
        bail!("sweep-orphans expects a non-negative number of minutes");
    }
    let config = AppConfig::from_env()?;
    let pool = db::init_pool_with_size(&config.database_url, 1)?;
    let cutoff = (Utc::now() - ChronoDuration::minutes(minutes)).naive_utc();

    let swept = tokio::task::spawn_blocking(move || -> Result<Vec<uuid::Uuid>> {
        let mut conn = pool.get().context("failed to get database connection")?;
        sweep_orphans(&mut conn, cutoff).context("failed to sweep orphaned challenges")
    })
    .await
    .context("sweep task panicked")??;

    if swept.is_empty() {
        println!("No orphaned challenges found.");
    } else {
        println!("Marked {} orphaned challenges as ERROR:", swept.len());
        for id in swept {
            println!("  {id}");
        }
    }
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
