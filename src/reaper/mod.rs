use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReaperConfig;
use crate::health::HealthMetrics;
use crate::model::Session;
use crate::store::SessionStore;

/// Summary of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Stale open sessions returned by the scan.
    pub scanned: usize,
    /// Sessions closed successfully.
    pub closed: usize,
    /// Sessions whose close failed; they are retried on the next pass.
    pub failed: usize,
}

/// End time and duration (whole seconds) for closing a silent session.
///
/// A session that never heartbeated closes at its own start with zero
/// duration.
pub fn close_policy(session: &Session) -> (DateTime<Utc>, i64) {
    let end_time = session.last_heartbeat.unwrap_or(session.start_time);
    let duration = (end_time - session.start_time).num_seconds().max(0);
    (end_time, duration)
}

/// Periodically closes OPEN sessions that stopped heartbeating.
///
/// Runs independently of the coalescer. Concurrent merges are harmless
/// because the store never merges into a CLOSED session.
pub struct Reaper<S> {
    scanner: Arc<Scanner<S>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Scanner<S> {
    store: Arc<S>,
    cfg: ReaperConfig,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
}

impl<S: SessionStore> Reaper<S> {
    pub fn new(store: Arc<S>, cfg: ReaperConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let cancel = CancellationToken::new();

        Self {
            scanner: Arc::new(Scanner {
                store,
                cfg,
                health,
                cancel: cancel.clone(),
            }),
            cancel,
            task: None,
        }
    }

    /// Runs one pass as of `now`. After `stop`, the pass closes nothing.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        self.scanner.reap_at(now).await
    }

    /// Spawns the interval loop. The first pass runs one interval from now.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }

        let scanner = Arc::clone(&self.scanner);
        let cancel = self.cancel.clone();
        let interval = scanner.cfg.interval;

        info!(
            interval = ?interval,
            timeout = ?scanner.cfg.timeout,
            "liveness reaper started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = scanner.reap_at(Utc::now()).await {
                            error!(error = %e, "reaper pass failed");
                        }
                    }
                }
            }
        }));
    }

    /// Cancels the loop and waits for an in-progress pass to reach the end
    /// of its current close. Sessions it did not get to stay OPEN for the
    /// next run.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "reaper task ended abnormally");
            }
        }
    }
}

impl<S: SessionStore> Scanner<S> {
    async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let started = Instant::now();

        let timeout =
            chrono::Duration::from_std(self.cfg.timeout).context("reaper timeout out of range")?;
        let cutoff = now
            .checked_sub_signed(timeout)
            .context("reaper cutoff out of range")?;

        let stale = match self.store.find_stale_open_sessions(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                if let Some(health) = &self.health {
                    health.reap_scan_errors.inc();
                }
                return Err(e).context("scanning for stale sessions");
            }
        };

        let mut report = ReapReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for session in &stale {
            if self.cancel.is_cancelled() {
                info!(
                    remaining = report.scanned - report.closed - report.failed,
                    "reaper pass interrupted by stop"
                );
                break;
            }

            let (end_time, duration) = close_policy(session);

            match self.store.close_session(&session.id, end_time, duration).await {
                Ok(()) => {
                    report.closed += 1;
                    debug!(session_id = %session.id, %end_time, duration, "closed stale session");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, session_id = %session.id, "closing stale session failed");
                }
            }
        }

        if let Some(health) = &self.health {
            health.sessions_reaped.inc_by(report.closed as f64);
            health.reap_close_errors.inc_by(report.failed as f64);
            health.reap_duration.observe(started.elapsed().as_secs_f64());
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                closed = report.closed,
                failed = report.failed,
                %cutoff,
                "reaper pass completed"
            );
        }

        Ok(report)
    }
}
