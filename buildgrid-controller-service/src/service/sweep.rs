use std::sync::Arc;
use std::time::SystemTime;

use buildgrid_common::model::now_utc;
use chrono::Duration as ChronoDuration;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::SweepConfig;
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;
use crate::service::token::TokenService;
use crate::storage::ArtifactStore;

#[derive(Debug, Default, Clone, Copy)]
pub struct StalenessSweepReport {
    pub workers_marked_offline: u64,
    pub builds_released: u64,
}

/// The background maintenance tasks: the worker staleness sweep and the
/// expired-token / staging cleanup. Each loop survives individual sweep
/// failures; cancellation happens between workers, never mid-transaction.
pub struct Sweeps {
    worker_repo: Arc<dyn WorkerRepo>,
    token_service: Arc<dyn TokenService>,
    artifact_store: Arc<ArtifactStore>,
    config: SweepConfig,
}

impl Sweeps {
    pub fn new(
        worker_repo: Arc<dyn WorkerRepo>,
        token_service: Arc<dyn TokenService>,
        artifact_store: Arc<ArtifactStore>,
        config: SweepConfig,
    ) -> Self {
        Self {
            worker_repo,
            token_service,
            artifact_store,
            config,
        }
    }

    /// One pass of the staleness sweep: every worker whose last_seen is
    /// older than the staleness threshold goes Offline and its in-progress
    /// builds return to Pending, one transaction per worker.
    pub async fn run_staleness_sweep_once(&self) -> Result<StalenessSweepReport, RepoError> {
        let now = now_utc();
        let cutoff = now
            - ChronoDuration::from_std(self.config.worker_staleness).unwrap_or_default();
        let stale = self.worker_repo.stale_workers(cutoff).await?;

        let mut report = StalenessSweepReport::default();
        for worker in stale {
            let released = self
                .worker_repo
                .mark_offline_and_release(&worker.id, None, now)
                .await?;
            info!(
                worker_id = %worker.id,
                released = released.len(),
                "stale worker marked offline"
            );
            report.workers_marked_offline += 1;
            report.builds_released += released.len() as u64;
        }
        Ok(report)
    }

    /// One pass of the token/staging cleanup: expired OTP and guest tokens
    /// are dropped, and staging files past the grace period are removed.
    pub async fn run_cleanup_once(&self) -> anyhow::Result<()> {
        let dropped = self.token_service.sweep_expired().await?;
        if dropped > 0 {
            info!(dropped, "expired tokens removed");
        }
        let staging_cutoff = SystemTime::now() - self.config.staging_grace;
        let removed = self.artifact_store.clean_staging(staging_cutoff).await?;
        if removed > 0 {
            info!(removed, "orphaned staging files removed");
        }
        Ok(())
    }

    /// Spawns both loops. A failed pass is logged and the loop carries on at
    /// the next tick.
    pub fn spawn(self: &Arc<Self>, join_set: &mut JoinSet<Result<(), anyhow::Error>>) {
        let staleness = Arc::clone(self);
        join_set.spawn(async move {
            let mut interval = tokio::time::interval(staleness.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = staleness.run_staleness_sweep_once().await {
                    error!(error = %err, "staleness sweep failed");
                }
            }
        });

        let cleanup = Arc::clone(self);
        join_set.spawn(async move {
            let mut interval = tokio::time::interval(cleanup.config.token_cleanup_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = cleanup.run_cleanup_once().await {
                    error!(error = %err, "token cleanup sweep failed");
                }
            }
        });
    }
}
