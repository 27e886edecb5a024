//! Binary entrypoint: bootstraps the repository store, event bus, and job
//! runtime, then waits for a shutdown signal. Grounded in the teacher's
//! `main.rs` (`dotenvy::dotenv()`, `DATABASE_PATH` env var) minus the Rocket
//! HTTP surface, which is out of scope here (spec §1) — this binary runs the
//! control-plane core standalone; an external CRUD/web process is expected
//! to talk to the same database.

use std::sync::Arc;
use vinsight::db::{Db, SqliteAlertChannelRepo, SqliteAlertRuleRepo, SqliteCheckRepo, SqliteIncidentRepo, SqliteMonitorRepo};
use vinsight::{Config, EventBus, JobRuntime, Repos};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "vinsight.db".into());
    let db = Arc::new(Db::new(&db_path).map_err(|e| anyhow::anyhow!("failed to initialize database at {db_path}: {e}"))?);

    let config = Config::from_env();
    let repos = Repos {
        monitors: Arc::new(SqliteMonitorRepo::new(db.clone())),
        checks: Arc::new(SqliteCheckRepo::new(db.clone())),
        incidents: Arc::new(SqliteIncidentRepo::new(db.clone())),
        rules: Arc::new(SqliteAlertRuleRepo::new(db.clone())),
        channels: Arc::new(SqliteAlertChannelRepo::new(db.clone())),
    };
    let bus = Arc::new(EventBus::new(config.event_subscriber_buffer));

    tracing::info!(
        probe_tick = ?config.probe_tick,
        eval_tick = ?config.eval_tick,
        notify_tick = ?config.notify_tick,
        worker_pool_size = config.probe_worker_pool_size,
        "starting vinsight control plane"
    );

    let runtime = Arc::new(JobRuntime::new(repos, bus, config)?);
    let handles = runtime.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining jobs");
    handles.stop().await;
    tracing::info!("shutdown complete");

    Ok(())
}
