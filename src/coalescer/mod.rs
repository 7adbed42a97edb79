pub mod buffer;
pub mod merge;
pub mod timer;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::CoalescerConfig;
use crate::health::HealthMetrics;
use crate::model::{PendingHeartbeat, SessionId};
use crate::store::{SessionStore, StoreError};

use self::buffer::{PendingBuffer, Push};
use self::merge::dedupe_latest;
use self::timer::FlushTimer;

/// Result of a single `flush()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush held the single-flight guard; nothing was done.
    InProgress,
    /// The buffer was empty; no store call was made.
    Empty,
    /// The batch was merged on the first attempt.
    Persisted { records: usize, rows: u64 },
    /// The first attempt failed and the retry succeeded.
    Retried { records: usize, rows: u64 },
    /// Both attempts failed and the batch was discarded.
    Dropped { records: usize },
}

/// Point-in-time view of the coalescer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoalescerMetrics {
    pub buffer_size: usize,
    pub total_enqueued: u64,
    /// Session rows updated by successful flushes.
    pub total_flushed: u64,
    /// Flush batches discarded after the retry failed.
    pub total_failed: u64,
    /// Heartbeats lost to capacity, shutdown, or a discarded batch.
    pub total_dropped: u64,
    pub is_flushing: bool,
    pub is_shutting_down: bool,
}

/// Buffers session heartbeats and writes them to the store in coalesced
/// batches.
///
/// A flush starts when the buffer reaches `flush_threshold` or when
/// `flush_delay` has passed since the first record of a cycle arrived,
/// whichever comes first. Only one flush runs at a time. The handle is
/// cheap to clone and every clone drives the same buffer.
pub struct Coalescer<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Coalescer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<S> {
    store: Arc<S>,
    cfg: CoalescerConfig,
    state: Mutex<State>,
    is_flushing: AtomicBool,
    shutting_down: AtomicBool,
    flush_done: Notify,
    total_enqueued: AtomicU64,
    total_flushed: AtomicU64,
    total_failed: AtomicU64,
    total_dropped: AtomicU64,
    health: Option<Arc<HealthMetrics>>,
}

/// Buffer and timer share one lock so the swap and the timer cancel are atomic.
struct State {
    buffer: PendingBuffer,
    timer: FlushTimer,
}

/// Holds the single-flight flag; dropping it releases the flag and wakes
/// anyone waiting for the flush to finish.
struct FlushGuard<'a, S> {
    shared: &'a Shared<S>,
}

impl<'a, S> FlushGuard<'a, S> {
    fn acquire(shared: &'a Shared<S>) -> Option<Self> {
        shared
            .is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;

        if let Some(health) = &shared.health {
            health.flush_in_progress.set(1.0);
        }

        Some(Self { shared })
    }
}

impl<S> Drop for FlushGuard<'_, S> {
    fn drop(&mut self) {
        self.shared.is_flushing.store(false, Ordering::Release);

        if let Some(health) = &self.shared.health {
            health.flush_in_progress.set(0.0);
        }

        self.shared.flush_done.notify_waiters();
    }
}

impl<S: SessionStore> Coalescer<S> {
    /// Creates a coalescer writing to `store`.
    pub fn new(store: Arc<S>, cfg: CoalescerConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let state = State {
            buffer: PendingBuffer::new(cfg.capacity),
            timer: FlushTimer::new(),
        };

        Self {
            shared: Arc::new(Shared {
                store,
                cfg,
                state: Mutex::new(state),
                is_flushing: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                flush_done: Notify::new(),
                total_enqueued: AtomicU64::new(0),
                total_flushed: AtomicU64::new(0),
                total_failed: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
                health,
            }),
        }
    }

    /// Schedules anything that was buffered before a runtime was available.
    pub fn start(&self) {
        tracing::info!(
            capacity = self.shared.cfg.capacity,
            flush_threshold = self.shared.cfg.flush_threshold,
            flush_delay = ?self.shared.cfg.flush_delay,
            chunk_size = self.shared.cfg.chunk_size,
            "heartbeat coalescer started"
        );

        self.reschedule();
    }

    /// Records a heartbeat. Never blocks and never fails.
    pub fn enqueue(
        &self,
        session_id: impl Into<SessionId>,
        observed_at: DateTime<Utc>,
        duration_candidate: Option<i64>,
        country_candidate: Option<&str>,
    ) {
        self.enqueue_heartbeat(PendingHeartbeat::new(
            session_id,
            observed_at,
            duration_candidate,
            country_candidate,
        ));
    }

    /// Records an already built heartbeat. Never blocks and never fails.
    pub fn enqueue_heartbeat(&self, hb: PendingHeartbeat) {
        let threshold = self.shared.cfg.flush_threshold;
        let mut state = self.shared.state.lock();

        // Checked under the lock so no record can slip in after the final drain.
        if self.shared.shutting_down.load(Ordering::Acquire) {
            drop(state);
            self.record_dropped(1, "shutdown");
            return;
        }

        let push = state.buffer.push(hb);
        let len = state.buffer.len();

        let flush_now = match push {
            Push::Rejected => {
                drop(state);
                self.record_dropped(1, "capacity");
                return;
            }
            Push::First if threshold > 1 => {
                self.arm_timer(&mut state);
                false
            }
            Push::First => true,
            Push::Appended(n) => n == threshold,
        };

        if flush_now {
            state.timer.cancel();
        }
        drop(state);

        self.shared.total_enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(health) = &self.shared.health {
            health.heartbeats_enqueued.inc();
            health.buffer_size.set(len as f64);
        }

        if flush_now {
            self.spawn_flush();
        }
    }

    /// Drains the buffer and merges it into the store.
    ///
    /// Returns immediately when the buffer is empty or another flush holds
    /// the single-flight guard.
    pub async fn flush(&self) -> FlushOutcome {
        let Some(guard) = FlushGuard::acquire(&self.shared) else {
            return FlushOutcome::InProgress;
        };

        let batch = self.take_buffer();
        let outcome = if batch.is_empty() {
            FlushOutcome::Empty
        } else {
            self.persist_batch(batch).await
        };

        drop(guard);
        self.reschedule();

        outcome
    }

    /// Stops accepting heartbeats and drains what is buffered.
    ///
    /// Waits up to `shutdown_grace` for an in-flight flush, then persists the
    /// remaining records once, with the usual single retry.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            self.shared.shutting_down.store(true, Ordering::Release);
            state.timer.cancel();
        }

        let grace = self.shared.cfg.shutdown_grace;
        let guard = match tokio::time::timeout(grace, self.acquire_guard()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!(
                    grace = ?grace,
                    "in-flight flush did not finish within shutdown grace period"
                );
                None
            }
        };

        let batch = self.take_buffer();
        let remaining = batch.len();
        let outcome = if batch.is_empty() {
            FlushOutcome::Empty
        } else {
            self.persist_batch(batch).await
        };
        drop(guard);

        tracing::info!(
            remaining,
            outcome = ?outcome,
            flushed = self.shared.total_flushed.load(Ordering::Relaxed),
            dropped = self.shared.total_dropped.load(Ordering::Relaxed),
            "heartbeat coalescer stopped"
        );
    }

    /// Returns a snapshot of the counters and flags.
    pub fn metrics(&self) -> CoalescerMetrics {
        CoalescerMetrics {
            buffer_size: self.buffer_size(),
            total_enqueued: self.shared.total_enqueued.load(Ordering::Relaxed),
            total_flushed: self.shared.total_flushed.load(Ordering::Relaxed),
            total_failed: self.shared.total_failed.load(Ordering::Relaxed),
            total_dropped: self.shared.total_dropped.load(Ordering::Relaxed),
            is_flushing: self.shared.is_flushing.load(Ordering::Acquire),
            is_shutting_down: self.shared.shutting_down.load(Ordering::Acquire),
        }
    }

    /// Number of heartbeats waiting for the next flush.
    pub fn buffer_size(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Swaps the buffer out and cancels the pending timer.
    fn take_buffer(&self) -> Vec<PendingHeartbeat> {
        let batch = {
            let mut state = self.shared.state.lock();
            state.timer.cancel();
            state.buffer.take()
        };

        if let Some(health) = &self.shared.health {
            health.buffer_size.set(0.0);
        }

        batch
    }

    async fn persist_batch(&self, batch: Vec<PendingHeartbeat>) -> FlushOutcome {
        let started = Instant::now();
        let received = batch.len();
        let batch = dedupe_latest(batch);
        let records = batch.len();

        tracing::debug!(received, records, "flushing heartbeat batch");

        let outcome = match self.persist_chunks(&batch).await {
            Ok(rows) => FlushOutcome::Persisted { records, rows },
            Err(first) => {
                tracing::warn!(error = %first, records, "heartbeat flush failed, retrying once");

                match self.persist_chunks(&batch).await {
                    Ok(rows) => FlushOutcome::Retried { records, rows },
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            records,
                            "dropping heartbeat batch after failed retry"
                        );
                        FlushOutcome::Dropped { records }
                    }
                }
            }
        };

        match outcome {
            FlushOutcome::Persisted { rows, .. } | FlushOutcome::Retried { rows, .. } => {
                self.shared.total_flushed.fetch_add(rows, Ordering::Relaxed);
                if let Some(health) = &self.shared.health {
                    health.sessions_merged.inc_by(rows as f64);
                }
            }
            FlushOutcome::Dropped { records } => {
                self.shared.total_failed.fetch_add(1, Ordering::Relaxed);
                self.record_dropped(records as u64, "batch");
            }
            FlushOutcome::InProgress | FlushOutcome::Empty => {}
        }

        if let Some(health) = &self.shared.health {
            let label = match outcome {
                FlushOutcome::Retried { .. } => "retried",
                FlushOutcome::Dropped { .. } => "dropped",
                _ => "persisted",
            };
            health.flush_batches.with_label_values(&[label]).inc();
            health.flush_batch_size.observe(records as f64);
            health
                .flush_duration
                .observe(started.elapsed().as_secs_f64());
        }

        outcome
    }

    async fn persist_chunks(&self, batch: &[PendingHeartbeat]) -> Result<u64, StoreError> {
        let chunk_size = self.shared.cfg.chunk_size.max(1);
        let mut rows = 0u64;

        for chunk in batch.chunks(chunk_size) {
            rows += self.shared.store.merge_heartbeats(chunk).await?;
        }

        Ok(rows)
    }

    /// Picks up records that arrived while a flush held the guard.
    fn reschedule(&self) {
        if self.shared.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.shared.state.lock();
        let len = state.buffer.len();
        if len == 0 {
            return;
        }

        if len >= self.shared.cfg.flush_threshold {
            state.timer.cancel();
            drop(state);
            self.spawn_flush();
        } else if !state.timer.is_armed() {
            self.arm_timer(&mut state);
        }
    }

    fn arm_timer(&self, state: &mut State) {
        let this = self.clone();
        let armed = state.timer.arm(self.shared.cfg.flush_delay, async move {
            this.flush().await;
        });

        if !armed {
            tracing::warn!("no async runtime, heartbeat flush timer not armed");
        }
    }

    fn spawn_flush(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    this.flush().await;
                });
            }
            Err(_) => {
                tracing::warn!("no async runtime, size-triggered heartbeat flush skipped");
            }
        }
    }

    /// Waits until the single-flight guard is free and takes it.
    async fn acquire_guard(&self) -> FlushGuard<'_, S> {
        loop {
            if let Some(guard) = FlushGuard::acquire(&self.shared) {
                return guard;
            }
            self.wait_for_flush().await;
        }
    }

    async fn wait_for_flush(&self) {
        loop {
            let notified = self.shared.flush_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.shared.is_flushing.load(Ordering::Acquire) {
                return;
            }

            notified.await;
        }
    }

    fn record_dropped(&self, count: u64, reason: &str) {
        self.shared.total_dropped.fetch_add(count, Ordering::Relaxed);

        if let Some(health) = &self.shared.health {
            health
                .heartbeats_dropped
                .with_label_values(&[reason])
                .inc_by(count as f64);
        }

        tracing::debug!(count, reason, "heartbeats dropped");
    }
}
