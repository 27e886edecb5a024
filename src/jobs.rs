//! Job runtime (C7, §4.7). Hosts the three periodic jobs — probe scheduler
//! (C2/C3), alert evaluator (C4), notification dispatcher (C5) — plus the
//! shared event bus (C6) they publish through.
//!
//! Grounded in the teacher's `checker.rs::run_checker`, which runs a single
//! `loop { ... tokio::select! { _ = time::sleep(...) => {}, _ = shutdown ... } }`
//! against a `rocket::Shutdown` future. This crate has no Rocket, so the
//! shutdown signal is a `tokio::sync::watch<bool>` instead — same shape,
//! owned rather than framework-provided. Each job is a single sequential
//! loop (sleep, then run, then sleep again), which gives non-overlapping
//! execution for free: the next sleep cannot start until the previous tick's
//! work has returned.

use crate::config::Config;
use crate::eventbus::EventBus;
use crate::evaluator::Evaluator;
use crate::repo::Repos;
use crate::{notify, pool, probe};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Owns the repositories, HTTP client, and event bus the three jobs share,
/// and the `Config` cadences/bounds they run under.
pub struct JobRuntime {
    repos: Repos,
    client: reqwest::Client,
    bus: Arc<EventBus>,
    evaluator: Arc<Evaluator>,
    config: Config,
}

/// Handles returned by [`JobRuntime::start`]. Drop or call [`JobHandles::stop`]
/// to shut the jobs down gracefully.
pub struct JobHandles {
    shutdown_tx: watch::Sender<bool>,
    probe_task: JoinHandle<()>,
    eval_task: JoinHandle<()>,
    notify_task: JoinHandle<()>,
}

impl JobRuntime {
    pub fn new(repos: Repos, bus: Arc<EventBus>, config: Config) -> anyhow::Result<Self> {
        let client = probe::build_client()?;
        Ok(JobRuntime {
            repos,
            client,
            bus,
            evaluator: Arc::new(Evaluator::new()),
            config,
        })
    }

    /// Launch the three jobs (§4.7 "Lifecycle" `start()`). Each fires on its
    /// own cadence; a panic inside one tick's invocation is caught and
    /// logged without affecting the job's future ticks or the other two jobs
    /// (§4.7 "Failure isolation").
    pub fn start(self: Arc<Self>) -> JobHandles {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let probe_task = {
            let rt = self.clone();
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(rt.config.probe_tick) => {}
                        _ = rx.changed() => break,
                    }
                    run_isolated("probe scheduler", {
                        let rt = rt.clone();
                        async move {
                            pool::run_tick(&rt.repos, &rt.client, &rt.bus, rt.config.probe_worker_pool_size).await;
                        }
                    })
                    .await;
                }
                info!("probe scheduler job stopped");
            })
        };

        let eval_task = {
            let rt = self.clone();
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(rt.config.eval_tick) => {}
                        _ = rx.changed() => break,
                    }
                    run_isolated("alert evaluator", {
                        let rt = rt.clone();
                        async move {
                            rt.evaluator.run_tick(&rt.repos, &rt.bus, rt.config.eval_window).await;
                        }
                    })
                    .await;
                }
                info!("alert evaluator job stopped");
            })
        };

        let notify_task = {
            let rt = self.clone();
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(rt.config.notify_tick) => {}
                        _ = rx.changed() => break,
                    }
                    run_isolated("notification dispatcher", {
                        let rt = rt.clone();
                        async move {
                            notify::run_tick(&rt.repos, &rt.client).await;
                        }
                    })
                    .await;
                }
                info!("notification dispatcher job stopped");
            })
        };

        JobHandles {
            shutdown_tx,
            probe_task,
            eval_task,
            notify_task,
        }
    }
}

/// Runs one tick's future on its own task so a panic is caught as a
/// `JoinError` rather than aborting the caller's loop (§4.7 "Failure
/// isolation").
async fn run_isolated<F>(job_name: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(fut).await {
        error!(job = job_name, error = %e, "job tick panicked");
    }
}

impl JobHandles {
    /// Graceful shutdown (§4.7 "Lifecycle" `stop()`): signal cancellation and
    /// wait for in-flight ticks to exit. Bounded by the probe timeout in
    /// practice, since `pool::run_tick` awaits every spawned probe task
    /// before returning.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in [
            ("probe scheduler", self.probe_task),
            ("alert evaluator", self.eval_task),
            ("notification dispatcher", self.notify_task),
        ] {
            if let Err(e) = handle.await {
                error!(job = name, error = %e, "job task failed to join during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Db, SqliteAlertChannelRepo, SqliteAlertRuleRepo, SqliteCheckRepo, SqliteIncidentRepo, SqliteMonitorRepo};
    use std::time::Duration;

    fn repos_over_temp_db() -> Repos {
        let path = format!("/tmp/vinsight_jobs_test_{}.db", uuid::Uuid::new_v4());
        let db = Arc::new(Db::new(&path).unwrap());
        Repos {
            monitors: Arc::new(SqliteMonitorRepo::new(db.clone())),
            checks: Arc::new(SqliteCheckRepo::new(db.clone())),
            incidents: Arc::new(SqliteIncidentRepo::new(db.clone())),
            rules: Arc::new(SqliteAlertRuleRepo::new(db.clone())),
            channels: Arc::new(SqliteAlertChannelRepo::new(db.clone())),
        }
    }

    #[tokio::test]
    async fn start_and_stop_completes_without_hanging() {
        let repos = repos_over_temp_db();
        let bus = Arc::new(EventBus::new(10));
        let mut config = Config::default();
        config.probe_tick = Duration::from_millis(20);
        config.eval_tick = Duration::from_millis(25);
        config.notify_tick = Duration::from_millis(30);

        let runtime = Arc::new(JobRuntime::new(repos, bus, config).unwrap());
        let handles = runtime.start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        tokio::time::timeout(Duration::from_secs(5), handles.stop())
            .await
            .expect("shutdown should complete promptly");
    }
}
