use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::coalescer::{Coalescer, CoalescerMetrics};
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::migrate::{Migrator, PostgresMigrator};
use crate::reaper::Reaper;
use crate::store::{PostgresSessionStore, StorePool};

/// Interval between coalescer stats log lines.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Agent orchestrates all components: health server, store pool,
/// migrations, heartbeat coalescer, and liveness reaper.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    pool: Option<StorePool>,
    coalescer: Option<Coalescer<PostgresSessionStore>>,
    reaper: Option<Reaper<PostgresSessionStore>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            pool: None,
            coalescer: None,
            reaper: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before migrations so health checks respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Connect to the session store.
        let mut pool = StorePool::new(self.cfg.database.clone());
        pool.start().await.context("starting session store pool")?;
        self.health.store_connected.set(1.0);

        let pg = pool
            .pool()
            .cloned()
            .context("session store pool not available after start")?;
        self.pool = Some(pool);

        // 2. Run migrations if enabled.
        if self.cfg.database.migrations.enabled {
            info!("running session store migrations...");
            PostgresMigrator::new(pg.clone())
                .up()
                .await
                .context("running session store migrations")?;
        }

        let store = Arc::new(PostgresSessionStore::new(
            pg,
            Some(Arc::clone(&self.health)),
        ));

        // 3. Heartbeat coalescer.
        let coalescer = Coalescer::new(
            Arc::clone(&store),
            self.cfg.coalescer.clone(),
            Some(Arc::clone(&self.health)),
        );
        coalescer.start();
        self.coalescer = Some(coalescer);

        // 4. Liveness reaper.
        if self.cfg.reaper.enabled {
            let mut reaper = Reaper::new(
                store,
                self.cfg.reaper.clone(),
                Some(Arc::clone(&self.health)),
            );
            reaper.start();
            self.reaper = Some(reaper);
        } else {
            info!("liveness reaper disabled");
        }

        // 5. Background stats reporter.
        self.spawn_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Returns the coalescer handle for the heartbeat ingestion path.
    pub fn coalescer(&self) -> Option<Coalescer<PostgresSessionStore>> {
        self.coalescer.clone()
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Drain buffered heartbeats first, while the pool is still open.
        if let Some(coalescer) = &self.coalescer {
            coalescer.shutdown().await;
        }

        if let Some(reaper) = &mut self.reaper {
            reaper.stop().await;
        }

        if let Some(pool) = &mut self.pool {
            if let Err(e) = pool.stop().await {
                error!(error = %e, "error stopping session store pool");
            }
            self.health.store_connected.set(0.0);
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background coalescer stats reporter.
    fn spawn_stats_reporter(&self) {
        let Some(coalescer) = self.coalescer.clone() else {
            return;
        };
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut last = coalescer.metrics();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let now = coalescer.metrics();
                        log_stats_delta(&last, &now);
                        last = now;
                    }
                }
            }
        });
    }
}

/// Logs heartbeat activity since the previous snapshot, if there was any.
fn log_stats_delta(prev: &CoalescerMetrics, now: &CoalescerMetrics) {
    let enqueued = now.total_enqueued.saturating_sub(prev.total_enqueued);
    let flushed = now.total_flushed.saturating_sub(prev.total_flushed);
    let dropped = now.total_dropped.saturating_sub(prev.total_dropped);

    if enqueued == 0 && flushed == 0 && dropped == 0 {
        return;
    }

    info!(
        enqueued,
        flushed,
        dropped,
        buffered = now.buffer_size,
        failed_batches = now.total_failed,
        "heartbeat stats (60s)"
    );
}
