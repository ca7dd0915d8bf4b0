//! Daily backup cycle.
//!
//! [`BackupScheduler`] is constructed once by the process entry point and
//! shared by reference. One tokio task sleeps until the next wall-clock firing,
//! then runs archive-then-prune on the blocking pool. At most one cycle runs
//! at a time; an overlapping trigger is dropped and recorded as a fault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backup::{BackupArchiver, BackupError, BackupGeneration, PruneReport, RetentionPruner};
use crate::config::ScheduleConfig;

/// Scheduler faults. Logged and recorded; never fatal to later runs.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SchedulerFault {
    /// A cycle was triggered while another was running.
    #[error("backup cycle already running; trigger dropped")]
    Overlap,

    /// The cycle failed.
    #[error("backup cycle failed: {0}")]
    CycleFailed(String),

    /// No next firing time could be computed.
    #[error("timer misfire: {0}")]
    Misfire(String),
}

/// A fault with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    /// When the fault happened.
    pub at: DateTime<Utc>,
    /// The fault.
    pub fault: SchedulerFault,
}

/// Result of one archive-then-prune cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// The generation created.
    pub generation: BackupGeneration,
    /// What the pruner did afterwards.
    pub prune: PruneReport,
}

/// Snapshot of scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether the daily timer is armed.
    pub enabled: bool,
    /// Start of the last cycle.
    pub last_run: Option<DateTime<Utc>>,
    /// Next planned firing.
    pub next_run: Option<DateTime<Utc>>,
    /// Whether a cycle is running now.
    pub running: bool,
    /// Most recent fault.
    pub last_fault: Option<FaultRecord>,
}

#[derive(Default)]
struct State {
    initialized: bool,
    timer: Option<Timer>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    last_fault: Option<FaultRecord>,
}

struct Timer {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    archiver: Arc<BackupArchiver>,
    pruner: RetentionPruner,
    retention: usize,
    schedule: ScheduleConfig,
    running: AtomicBool,
    state: Mutex<State>,
}

/// Process-wide backup scheduler.
#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<Inner>,
}

impl BackupScheduler {
    /// Create a scheduler. Nothing runs until [`init`](Self::init) or
    /// [`start`](Self::start).
    pub fn new(
        archiver: Arc<BackupArchiver>,
        pruner: RetentionPruner,
        retention: usize,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                archiver,
                pruner,
                retention,
                schedule,
                running: AtomicBool::new(false),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// One-time initialisation: arms the timer if the schedule is enabled.
    ///
    /// Returns false when already initialised. Must be called inside a tokio
    /// runtime.
    pub fn init(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.initialized {
                return false;
            }
            state.initialized = true;
        }
        if self.inner.schedule.enabled {
            self.start();
        }
        info!(
            enabled = self.inner.schedule.enabled,
            time = %self.inner.schedule.time,
            timezone = %self.inner.schedule.timezone,
            "backup scheduler initialised"
        );
        true
    }

    /// Arm the daily timer. No-op if it is already armed.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.timer.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }

        let (stop, stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(timer_loop(inner, stop_rx));
        state.timer = Some(Timer { stop, handle });
        state.next_run = next_fire(Utc::now(), &self.inner.schedule);
        info!(next_run = ?state.next_run, "backup timer started");
    }

    /// Disarm the timer. A cycle already running completes.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.timer.take() {
            let _ = timer.stop.send(true);
            info!("backup timer stopped");
        }
        state.next_run = None;
    }

    /// Disarm the timer and wait for the task (and any running cycle) to end.
    pub async fn shutdown(&self) {
        let timer = {
            let mut state = self.inner.state.lock();
            state.next_run = None;
            state.initialized = false;
            state.timer.take()
        };
        if let Some(timer) = timer {
            let _ = timer.stop.send(true);
            if let Err(e) = timer.handle.await {
                warn!(error = %e, "backup timer task panicked");
            }
        }
        info!("backup scheduler shut down");
    }

    /// Current state.
    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock();
        SchedulerStatus {
            enabled: state.timer.as_ref().is_some_and(|t| !t.handle.is_finished()),
            last_run: state.last_run,
            next_run: state.next_run,
            running: self.inner.running.load(Ordering::SeqCst),
            last_fault: state.last_fault.clone(),
        }
    }

    /// Run a cycle immediately, outside the timer.
    pub async fn trigger_now(&self) -> Result<CycleReport, SchedulerFault> {
        run_cycle(self.inner.clone()).await
    }
}

async fn timer_loop(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    loop {
        let now = Utc::now();
        let Some(next) = next_fire(now, &inner.schedule) else {
            let fault = SchedulerFault::Misfire("no valid firing time in the next days".to_string());
            warn!(%fault, "backup timer giving up");
            inner.record_fault(fault);
            break;
        };
        inner.state.lock().next_run = Some(next);

        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next_run = %next, wait_secs = wait.as_secs(), "backup timer sleeping");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }

        if *stop.borrow() {
            break;
        }
        // Errors are recorded inside; the next firing is unaffected.
        let _ = run_cycle(inner.clone()).await;
    }
    debug!("backup timer task exiting");
}

#[instrument(skip(inner))]
async fn run_cycle(inner: Arc<Inner>) -> Result<CycleReport, SchedulerFault> {
    let Some(running) = RunningGuard::claim(&inner) else {
        let fault = SchedulerFault::Overlap;
        warn!(%fault, "dropping overlapping backup trigger");
        inner.record_fault(fault.clone());
        return Err(fault);
    };

    inner.state.lock().last_run = Some(Utc::now());

    // The blocking task owns the running flag and records its own outcome.
    let worker = inner.clone();
    let span = tracing::Span::current();
    let joined = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let _running = running;
        let result = worker.cycle().map_err(|e| SchedulerFault::CycleFailed(e.to_string()));
        worker.finish(&result);
        result
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(e) => {
            let fault = SchedulerFault::CycleFailed(format!("cycle task failed: {e}"));
            warn!(%fault, "backup cycle failed");
            inner.record_fault(fault.clone());
            Err(fault)
        }
    }
}

/// Holds the scheduler's running flag; clears it on drop.
struct RunningGuard(Arc<Inner>);

impl RunningGuard {
    fn claim(inner: &Arc<Inner>) -> Option<Self> {
        if inner.running.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(inner.clone()))
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    fn cycle(&self) -> Result<CycleReport, BackupError> {
        let generation = self.archiver.create_backup()?;
        let prune = self.pruner.prune(self.retention)?;
        Ok(CycleReport { generation, prune })
    }

    fn finish(&self, result: &Result<CycleReport, SchedulerFault>) {
        match result {
            Ok(report) => info!(
                generation = %report.generation.name,
                deleted = report.prune.deleted.len(),
                deferred = report.prune.deferred.len(),
                "backup cycle finished"
            ),
            Err(fault) => {
                warn!(%fault, "backup cycle failed");
                self.record_fault(fault.clone());
            }
        }
    }

    fn record_fault(&self, fault: SchedulerFault) {
        self.state.lock().last_fault = Some(FaultRecord {
            at: Utc::now(),
            fault,
        });
    }
}

/// First firing strictly after `now`.
///
/// Local times inside a DST gap roll forward to the first valid instant;
/// ambiguous local times take the earlier instant.
pub fn next_fire(now: DateTime<Utc>, schedule: &ScheduleConfig) -> Option<DateTime<Utc>> {
    let tz = schedule.timezone;
    let mut date = now.with_timezone(&tz).date_naive();
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(tz, date, schedule.time) {
            if candidate > now {
                return Some(candidate);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let mut local: NaiveDateTime = date.and_time(time);
    // DST gaps are at most a few hours.
    for _ in 0..=240 {
        match tz.from_local_datetime(&local) {
            LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earlier, _) => return Some(earlier.with_timezone(&Utc)),
            LocalResult::None => local += Duration::minutes(1),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::GenerationLeases;
    use crate::config::VaultConfig;
    use crate::store::Store;

    fn berlin(time: &str) -> ScheduleConfig {
        ScheduleConfig::parse(time, "Europe/Berlin").unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_fire_same_day_and_next_day() {
        let schedule = berlin("02:00");
        // 02:00 CET is 01:00 UTC in winter.
        assert_eq!(
            next_fire(at("2026-01-10T00:30:00Z"), &schedule),
            Some(at("2026-01-10T01:00:00Z"))
        );
        assert_eq!(
            next_fire(at("2026-01-10T01:00:00Z"), &schedule),
            Some(at("2026-01-11T01:00:00Z"))
        );
    }

    #[test]
    fn test_next_fire_rolls_out_of_dst_gap() {
        // 2026-03-29 02:00 CET jumps to 03:00 CEST.
        let schedule = berlin("02:30");
        assert_eq!(
            next_fire(at("2026-03-28T23:00:00Z"), &schedule),
            Some(at("2026-03-29T01:00:00Z"))
        );
    }

    #[test]
    fn test_next_fire_takes_earlier_ambiguous_instant() {
        // 2026-10-25 03:00 CEST falls back to 02:00 CET.
        let schedule = berlin("02:30");
        assert_eq!(
            next_fire(at("2026-10-24T23:00:00Z"), &schedule),
            Some(at("2026-10-25T00:30:00Z"))
        );
    }

    fn scheduler(dir: &std::path::Path, schedule: ScheduleConfig) -> BackupScheduler {
        scheduler_with_store(dir, schedule).0
    }

    fn scheduler_with_store(
        dir: &std::path::Path,
        schedule: ScheduleConfig,
    ) -> (BackupScheduler, Arc<Store>) {
        let config = VaultConfig::new(dir).with_retention(2);
        let store = Arc::new(Store::open(&config.store_path).unwrap());
        store
            .with_conn(|conn| conn.execute_batch("CREATE TABLE tests (id INTEGER PRIMARY KEY);"))
            .unwrap();
        let archiver = Arc::new(BackupArchiver::new(store.clone(), &config));
        let pruner = RetentionPruner::new(&config.backups_dir, GenerationLeases::new());
        let scheduler = BackupScheduler::new(archiver, pruner, config.retention, schedule);
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_trigger_now_runs_cycle_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), berlin("02:00").disabled());

        for _ in 0..3 {
            scheduler.trigger_now().await.unwrap();
        }
        let report = scheduler.trigger_now().await.unwrap();
        assert_eq!(report.prune.kept.len(), 2);
        assert_eq!(report.prune.deleted.len(), 1);

        let status = scheduler.status();
        assert!(status.last_run.is_some());
        assert!(!status.running);
        assert!(status.last_fault.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), berlin("02:00").disabled());

        scheduler.inner.running.store(true, Ordering::SeqCst);
        assert_eq!(scheduler.trigger_now().await.unwrap_err(), SchedulerFault::Overlap);
        scheduler.inner.running.store(false, Ordering::SeqCst);

        let status = scheduler.status();
        assert_eq!(status.last_fault.unwrap().fault, SchedulerFault::Overlap);
        assert!(scheduler.trigger_now().await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_trigger_does_not_wedge_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, store) = scheduler_with_store(dir.path(), berlin("02:00").disabled());

        let maintenance = store.maintenance().acquire("test");
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            scheduler.trigger_now(),
        )
        .await;
        assert!(waited.is_err());
        assert!(scheduler.status().running);
        drop(maintenance);

        for _ in 0..100 {
            if !scheduler.status().running {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(!scheduler.status().running);
        assert!(scheduler.status().last_fault.is_none());

        let report = scheduler.trigger_now().await.unwrap();
        assert_eq!(report.prune.kept.len(), 2);
    }

    #[tokio::test]
    async fn test_init_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), berlin("02:00"));

        assert!(scheduler.init());
        assert!(!scheduler.init());
        let status = scheduler.status();
        assert!(status.enabled);
        assert!(status.next_run.is_some());

        scheduler.stop();
        let status = scheduler.status();
        assert!(!status.enabled);
        assert!(status.next_run.is_none());

        scheduler.start();
        assert!(scheduler.status().enabled);
        scheduler.shutdown().await;
        assert!(!scheduler.status().enabled);
    }

    #[tokio::test]
    async fn test_disabled_schedule_is_not_armed_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), berlin("02:00").disabled());
        assert!(scheduler.init());
        assert!(!scheduler.status().enabled);
    }
}
