//! Parallel Coordinator
//!
//! Runs independent work items on a bounded pool of worker threads. For each
//! item it validates the item ID, reserves a credential, wraps the worker's
//! output with the item's prefix, runs the worker, releases the credential and
//! records the result.
//!
//! Cancellation is cooperative: a shutdown request (SIGINT/SIGTERM or
//! `ShutdownState::request_shutdown`) stops new items from starting, while
//! items already running finish normally. Unstarted items end up in the
//! checkpoint list, so `results.len() + checkpoints.len() == items.len()`
//! after every run.

use super::context::WorkerContext;
use super::types::{
    CoordinatorError, CredentialPolicy, ExecutionResult, ProgressStats, ReservationPolicy,
    RunReport, CREDENTIAL_UNAVAILABLE, DEFAULT_MAX_WORKERS, MAX_WORKERS_CAP,
};
use crate::config::BatchConfig;
use crate::credentials::{Credential, CredentialPool};
use crate::output::{OutputSink, PrefixedWriter};
use crate::sanitize::sanitize_identifier;
use crate::shutdown::{register_signal_handlers, ShutdownState};
use crate::utils::{format_duration, lock_mutex_recover, panic_message};

use chrono::Utc;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A reserved credential, released when dropped
struct Reservation<'a> {
    pool: &'a CredentialPool,
    credential: Credential,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(&self.credential) {
            log::error!("[ParallelCoordinator] Failed to release credential: {}", e);
        }
    }
}

/// Bounded worker pool for batch execution
pub struct ParallelCoordinator {
    max_workers: usize,
    credentials: Option<Arc<CredentialPool>>,
    reservation: ReservationPolicy,
    output: OutputSink,
    shutdown: ShutdownState,
    handle_signals: bool,
    // Per-run state, reset at the start of every execute()
    stats: Mutex<ProgressStats>,
    results: Mutex<Vec<ExecutionResult>>,
    checkpoints: Mutex<Vec<String>>,
}

impl ParallelCoordinator {
    /// Create a coordinator with `max_workers` concurrent workers.
    ///
    /// Zero workers is a configuration error; anything above 10 is clamped to
    /// 10 with a warning.
    pub fn new(max_workers: usize) -> Result<Self, CoordinatorError> {
        if max_workers == 0 {
            return Err(CoordinatorError::InvalidWorkerCount(max_workers));
        }

        let max_workers = if max_workers > MAX_WORKERS_CAP {
            log::warn!(
                "[ParallelCoordinator] max_workers {} exceeds cap, clamping to {}",
                max_workers,
                MAX_WORKERS_CAP
            );
            MAX_WORKERS_CAP
        } else {
            max_workers
        };

        Ok(Self::with_worker_count(max_workers))
    }

    /// Create a coordinator from a loaded `BatchConfig`
    pub fn from_config(config: &BatchConfig) -> Result<Self, CoordinatorError> {
        Ok(Self::new(config.max_workers)?.with_reservation(config.reservation_policy()))
    }

    fn with_worker_count(max_workers: usize) -> Self {
        Self {
            max_workers,
            credentials: None,
            reservation: ReservationPolicy::default(),
            output: OutputSink::stdout(),
            shutdown: ShutdownState::new(),
            handle_signals: true,
            stats: Mutex::new(ProgressStats::default()),
            results: Mutex::new(Vec::new()),
            checkpoints: Mutex::new(Vec::new()),
        }
    }

    /// Reserve a credential from `pool` for every item
    pub fn with_credentials(mut self, pool: Arc<CredentialPool>) -> Self {
        self.credentials = Some(pool);
        self
    }

    pub fn with_reservation(mut self, policy: ReservationPolicy) -> Self {
        self.reservation = policy;
        self
    }

    /// Destination for progress lines, summaries and prefixed worker output
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// Share a shutdown flag with the caller
    pub fn with_shutdown(mut self, shutdown: ShutdownState) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Whether `execute()` installs SIGINT/SIGTERM handlers (default: true)
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn credentials(&self) -> Option<&Arc<CredentialPool>> {
        self.credentials.as_ref()
    }

    pub fn shutdown_state(&self) -> &ShutdownState {
        &self.shutdown
    }

    /// Stats of the current or last run
    pub fn stats(&self) -> ProgressStats {
        *lock_mutex_recover(&self.stats)
    }

    /// Items of the last run that were never started because of a shutdown
    pub fn checkpoints(&self) -> Vec<String> {
        lock_mutex_recover(&self.checkpoints).clone()
    }

    /// Run `worker_fn` for every item.
    ///
    /// With `dry_run` the ordered item IDs are written to the output sink and
    /// nothing else happens: no credentials, no signal handlers, no worker
    /// calls, zeroed stats.
    pub fn execute<T, I, F>(
        &mut self,
        items: &[T],
        item_id_fn: I,
        worker_fn: F,
        dry_run: bool,
    ) -> RunReport
    where
        T: Sync,
        I: Fn(&T) -> String,
        F: Fn(&T, &mut WorkerContext<'_>) -> anyhow::Result<()> + Sync,
    {
        let run_id = uuid::Uuid::new_v4().to_string();
        let ids: Vec<String> = items.iter().map(&item_id_fn).collect();

        if dry_run {
            self.reset_run_state(0);
            return self.dry_run(run_id, &ids);
        }

        self.reset_run_state(ids.len());

        let _signals = if self.handle_signals {
            match register_signal_handlers(&self.shutdown) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    log::warn!(
                        "[ParallelCoordinator] Failed to register signal handlers: {}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let workers = self.max_workers.min(ids.len());
        log::info!(
            "[ParallelCoordinator] Run {} starting: {} items on {} workers",
            run_id,
            ids.len(),
            workers
        );

        let started = Instant::now();
        let duplicates = find_duplicates(&ids);
        let cursor = AtomicUsize::new(0);

        let this = &*self;
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| this.worker_loop(items, &ids, &duplicates, &cursor, &worker_fn));
            }
        });

        // Items are claimed in order, so everything past the cursor never started
        let dispatched = cursor.load(Ordering::SeqCst).min(ids.len());
        if dispatched < ids.len() {
            let mut checkpoints = lock_mutex_recover(&self.checkpoints);
            checkpoints.extend(ids[dispatched..].iter().cloned());
            log::warn!(
                "[ParallelCoordinator] Shutdown requested, {} items checkpointed",
                checkpoints.len()
            );
        }

        let report = RunReport {
            run_id,
            stats: self.stats(),
            results: std::mem::take(&mut *lock_mutex_recover(&self.results)),
            checkpoints: self.checkpoints(),
            elapsed: started.elapsed(),
            interrupted: self.shutdown.is_shutdown_requested(),
            dry_run: false,
        };

        self.write_summary(&report);
        report
    }

    fn reset_run_state(&self, total: usize) {
        *lock_mutex_recover(&self.stats) = ProgressStats::new(total);
        lock_mutex_recover(&self.results).clear();
        lock_mutex_recover(&self.checkpoints).clear();
        self.shutdown.reset();
    }

    fn dry_run(&self, run_id: String, ids: &[String]) -> RunReport {
        log::info!("[ParallelCoordinator] Dry run {}: {} items", run_id, ids.len());

        self.output
            .write_line(&format!("Dry run: {} items would be executed", ids.len()));
        for (index, id) in ids.iter().enumerate() {
            self.output.write_line(&format!("  {}. {}", index + 1, id));
        }

        RunReport {
            run_id,
            stats: ProgressStats::default(),
            results: Vec::new(),
            checkpoints: Vec::new(),
            elapsed: Duration::ZERO,
            interrupted: false,
            dry_run: true,
        }
    }

    /// Pull items until the queue is drained or shutdown is requested
    fn worker_loop<T, F>(
        &self,
        items: &[T],
        ids: &[String],
        duplicates: &[bool],
        cursor: &AtomicUsize,
        worker_fn: &F,
    ) where
        F: Fn(&T, &mut WorkerContext<'_>) -> anyhow::Result<()>,
    {
        loop {
            // A shutdown landing between this check and the claim below still
            // starts one item on this worker; in-flight stays <= max_workers.
            if self.shutdown.is_shutdown_requested() {
                break;
            }

            let index = cursor.fetch_add(1, Ordering::SeqCst);
            if index >= items.len() {
                break;
            }

            let result = self.execute_one(&items[index], &ids[index], duplicates[index], worker_fn);
            self.record(result);
        }
    }

    fn execute_one<T, F>(
        &self,
        item: &T,
        item_id: &str,
        duplicate: bool,
        worker_fn: &F,
    ) -> ExecutionResult
    where
        F: Fn(&T, &mut WorkerContext<'_>) -> anyhow::Result<()>,
    {
        let started_at = Utc::now();
        let start = Instant::now();

        if let Err(e) = sanitize_identifier(item_id) {
            log::warn!("[ParallelCoordinator] Skipping invalid item id: {}", e);
            return ExecutionResult::failure(
                item_id,
                format!("invalid item id: {}", e),
                start.elapsed(),
                started_at,
            );
        }

        if duplicate {
            log::warn!("[ParallelCoordinator] Skipping duplicate item id {}", item_id);
            return ExecutionResult::failure(
                item_id,
                "duplicate item id",
                start.elapsed(),
                started_at,
            );
        }

        let reservation = match self.credentials.as_deref() {
            None => None,
            Some(pool) => match self.reserve_with_retry(pool, item_id) {
                Some(credential) => Some(Reservation { pool, credential }),
                None => match self.reservation.on_exhausted {
                    CredentialPolicy::Fail => {
                        return ExecutionResult::failure(
                            item_id,
                            CREDENTIAL_UNAVAILABLE,
                            start.elapsed(),
                            started_at,
                        );
                    }
                    CredentialPolicy::RunWithout => {
                        log::warn!(
                            "[ParallelCoordinator] Running {} without a credential",
                            item_id
                        );
                        None
                    }
                },
            },
        };

        let mut output = PrefixedWriter::new(format!("[{}]", item_id), self.output.clone());
        let outcome = {
            let mut ctx = WorkerContext {
                item_id,
                credential: reservation.as_ref().map(|r| &r.credential),
                pool: self.credentials.as_deref(),
                output: &mut output,
                shutdown: &self.shutdown,
            };
            panic::catch_unwind(AssertUnwindSafe(|| worker_fn(item, &mut ctx)))
        };
        output.flush_pending();
        drop(reservation);

        let duration = start.elapsed();
        match outcome {
            Ok(Ok(())) => ExecutionResult::success(item_id, duration, started_at),
            Ok(Err(e)) => ExecutionResult::failure(item_id, format!("{:#}", e), duration, started_at),
            Err(payload) => ExecutionResult::failure(
                item_id,
                format!("worker panicked: {}", panic_message(payload.as_ref())),
                duration,
                started_at,
            ),
        }
    }

    /// Bounded, fixed-delay retry around the non-blocking `reserve()`
    fn reserve_with_retry(&self, pool: &CredentialPool, item_id: &str) -> Option<Credential> {
        let attempts = self.reservation.max_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(credential) = pool.reserve() {
                log::debug!(
                    "[ParallelCoordinator] {} reserved {} (attempt {})",
                    item_id,
                    credential,
                    attempt
                );
                return Some(credential);
            }
            if attempt < attempts {
                std::thread::sleep(self.reservation.retry_delay);
            }
        }

        log::warn!(
            "[ParallelCoordinator] No credential available for {} after {} attempts ({:?})",
            item_id,
            attempts,
            pool.status()
        );
        None
    }

    fn record(&self, result: ExecutionResult) {
        let stats = {
            let mut stats = lock_mutex_recover(&self.stats);
            stats.record(result.succeeded);
            *stats
        };

        let line = match &result.error {
            None => format!(
                "[{}/{}] {} succeeded in {}",
                stats.completed,
                stats.total,
                result.item_id,
                format_duration(result.duration)
            ),
            Some(error) => format!(
                "[{}/{}] {} failed after {}: {}",
                stats.completed,
                stats.total,
                result.item_id,
                format_duration(result.duration),
                error
            ),
        };

        if result.succeeded {
            log::info!("[ParallelCoordinator] {}", line);
        } else {
            log::warn!("[ParallelCoordinator] {}", line);
        }
        self.output.write_line(&line);

        lock_mutex_recover(&self.results).push(result);
    }

    fn write_summary(&self, report: &RunReport) {
        let status = if report.interrupted {
            "interrupted"
        } else {
            "complete"
        };
        let summary = format!(
            "Batch {}: {} items, {} succeeded, {} failed, {} checkpointed in {}",
            status,
            report.stats.total,
            report.stats.succeeded(),
            report.stats.failed,
            report.checkpoints.len(),
            format_duration(report.elapsed)
        );

        log::info!("[ParallelCoordinator] {}", summary);
        self.output.write_line(&summary);

        if !report.checkpoints.is_empty() {
            self.output.write_line(&format!(
                "Not started: {}",
                report.checkpoints.join(", ")
            ));
        }
    }
}

impl Default for ParallelCoordinator {
    fn default() -> Self {
        Self::with_worker_count(DEFAULT_MAX_WORKERS)
    }
}

/// Marks every repeated ID after its first occurrence
fn find_duplicates(ids: &[String]) -> Vec<bool> {
    let mut seen = HashSet::new();
    ids.iter().map(|id| !seen.insert(id.as_str())).collect()
}
