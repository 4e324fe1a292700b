//! Indexer state
//!
//! Owns the pending queue, the run flags and timers, the maintenance
//! scheduler and the collaborators. Constructed once per mailbox, started
//! with `start()` and torn down with `stop()`.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite::SqliteKvStore;
use crate::backend::alarms::TokioAlarms;
use crate::backend::{AlarmHost, Clock, KeyValueStore, MessageStore, SearchEngine, SystemClock};
use crate::config::SyncConfig;
use crate::sync::delayed_task::DelayedTask;
use crate::sync::maintenance::compaction::compact;
use crate::sync::maintenance::scan::{MaintenanceScan, ScanLimits};
use crate::sync::maintenance::{
    MaintenanceHistory, MaintenanceRunRecord, MaintenanceScheduler, TierName, TierStatus,
    LEGACY_ALARMS, TICK_ALARM,
};
use crate::sync::pending_queue::{load_snapshot, PendingQueue, UpdateKind};
use crate::sync::pipeline::{drop_stuck_entries, BatchOutcome, NoProgressCounter, Pipeline};
use crate::types::error::{Result, SyncError};
use crate::types::{Document, EngineStats, MutationEvent};

/// Everything the indexer talks to
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub engine: Arc<dyn SearchEngine>,
    pub kv: Arc<dyn KeyValueStore>,
    pub alarms: Arc<dyn AlarmHost>,
    /// Names of alarms as they fire
    pub alarm_events: Receiver<String>,
    pub clock: Arc<dyn Clock>,
}

/// One queue mutation derived from a host event
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub kind: UpdateKind,
    pub document: Document,
    pub reindex: bool,
}

/// Map a host notification onto queue mutations
pub fn plan_updates(event: MutationEvent) -> Vec<PlannedUpdate> {
    let plain = |kind, document| PlannedUpdate {
        kind,
        document,
        reindex: false,
    };

    match event {
        MutationEvent::New { documents, .. } => documents
            .into_iter()
            .map(|d| plain(UpdateKind::New, d))
            .collect(),
        MutationEvent::Deleted { documents, .. } => documents
            .into_iter()
            .map(|d| plain(UpdateKind::Deleted, d))
            .collect(),
        MutationEvent::Moved { before, after } => {
            if before.len() != after.len() {
                warn!(
                    "Move notification with {} sources and {} destinations",
                    before.len(),
                    after.len()
                );
            }
            let mut before = before.into_iter();
            let mut after = after.into_iter();
            let mut planned = Vec::new();
            loop {
                let (b, a) = (before.next(), after.next());
                if b.is_none() && a.is_none() {
                    break;
                }
                if let Some(b) = b {
                    planned.push(plain(UpdateKind::Deleted, b));
                }
                if let Some(a) = a {
                    planned.push(plain(UpdateKind::Moved, a));
                }
            }
            planned
        }
        MutationEvent::Copied { after, .. } => after
            .into_iter()
            .map(|d| plain(UpdateKind::New, d))
            .collect(),
        MutationEvent::Updated { document, changed } => {
            if changed.iter().any(|f| f.is_indexed()) {
                vec![PlannedUpdate {
                    kind: UpdateKind::New,
                    document,
                    reindex: true,
                }]
            } else {
                debug!("Ignoring update of unindexed fields {:?}", changed);
                Vec::new()
            }
        }
    }
}

/// Result of a batch trigger
#[derive(Debug)]
pub enum BatchRun {
    /// Another run was in progress
    Skipped,
    Completed(BatchOutcome),
    Failed(SyncError),
}

/// Result of a maintenance tick
#[derive(Debug)]
pub enum TickOutcome {
    /// A batch or another scan was running
    Busy,
    NotDue,
    Ran(MaintenanceRunRecord),
    Failed(SyncError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
    pub oldest_enqueued_at: Option<chrono::DateTime<chrono::Utc>>,
    pub processing: bool,
    pub in_backoff: bool,
    pub consecutive_no_progress: u32,
    /// Delay the waiting batch run was scheduled with
    pub next_batch_delay_ms: Option<u64>,
    pub last_error: Option<SyncError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceStatus {
    pub running: bool,
    pub tiers: Vec<TierStatus>,
    /// Oldest first
    pub history: Vec<MaintenanceRunRecord>,
    pub engine: Option<EngineStats>,
}

/// Sets a flag for its lifetime; the flag is cleared on drop whatever happens
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct IndexerState {
    config: SyncConfig,
    store: Arc<dyn MessageStore>,
    engine: Arc<dyn SearchEngine>,
    kv: Arc<dyn KeyValueStore>,
    alarms: Arc<dyn AlarmHost>,
    alarm_events: Receiver<String>,
    clock: Arc<dyn Clock>,

    queue: PendingQueue,
    processing: AtomicBool,
    maintenance_running: AtomicBool,
    in_backoff: AtomicBool,
    no_progress: NoProgressCounter,
    batch_task: DelayedTask,
    persist_task: DelayedTask,

    scheduler: MaintenanceScheduler,
    history: tokio::sync::Mutex<MaintenanceHistory>,
    last_error: tokio::sync::Mutex<Option<SyncError>>,
    last_stats: tokio::sync::Mutex<Option<EngineStats>>,

    events_tx: Sender<MutationEvent>,
    events_rx: Receiver<MutationEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl IndexerState {
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let Collaborators {
            store,
            engine,
            kv,
            alarms,
            alarm_events,
            clock,
        } = collaborators;

        let history = MaintenanceHistory::load(kv.as_ref(), config.history_capacity)?;
        let scheduler = MaintenanceScheduler::new(config.tiers.clone(), kv.clone());
        let (events_tx, events_rx) = flume::unbounded();

        Ok(Arc::new(Self {
            no_progress: NoProgressCounter::new(config.max_consecutive_no_progress),
            config,
            store,
            engine,
            kv,
            alarms,
            alarm_events,
            clock,
            queue: PendingQueue::new(),
            processing: AtomicBool::new(false),
            maintenance_running: AtomicBool::new(false),
            in_backoff: AtomicBool::new(false),
            batch_task: DelayedTask::new("index-batch"),
            persist_task: DelayedTask::new("queue-snapshot"),
            scheduler,
            history: tokio::sync::Mutex::new(history),
            last_error: tokio::sync::Mutex::new(None),
            last_stats: tokio::sync::Mutex::new(None),
            events_tx,
            events_rx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Standalone setup: SQLite settings at `config.db_path`, in-process
    /// alarms and the system clock
    pub fn open(
        config: SyncConfig,
        store: Arc<dyn MessageStore>,
        engine: Arc<dyn SearchEngine>,
    ) -> Result<Arc<Self>> {
        let kv = SqliteKvStore::open(&config.db_path)?;
        let (alarms, alarm_events) = TokioAlarms::new();
        info!("Indexer settings database: {:?}", config.db_path);

        Self::new(
            config,
            Collaborators {
                store,
                engine,
                kv: Arc::new(kv),
                alarms: Arc::new(alarms),
                alarm_events,
                clock: Arc::new(SystemClock),
            },
        )
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Sender for host mutation events; drained by the pump after `start()`
    pub fn event_sender(&self) -> Sender<MutationEvent> {
        self.events_tx.clone()
    }

    /// Restore the queue, register the tick alarm, start the event pump
    /// and run one catch-up tick.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        let restored = self.queue.restore(load_snapshot(self.kv.as_ref())?).await;
        if restored > 0 {
            info!("Restored {} queued updates from snapshot", restored);
        }
        if !self.queue.is_empty().await {
            self.schedule_batch(Duration::ZERO);
        }

        self.register_tick_alarm().await?;

        let pump = self.spawn_pump();
        let state = self.clone();
        let catch_up = tokio::spawn(async move {
            match state.run_maintenance_tick().await {
                TickOutcome::Failed(e) => error!("Startup maintenance tick failed: {}", e),
                outcome => debug!("Startup maintenance tick: {:?}", outcome),
            }
        });

        self.track(pump);
        self.track(catch_up);

        info!("Indexer started");
        Ok(())
    }

    /// Cancel timers, stop the pump and flush the queue snapshot
    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.batch_task.cancel();
        self.persist_task.cancel();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }

        let saved = self.persist_snapshot().await?;
        info!("Indexer stopped, {} queued updates persisted", saved);
        Ok(())
    }

    /// Keep a spawned task so `stop()` can abort it
    fn track(&self, task: JoinHandle<()>) {
        if self.stopped.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    async fn register_tick_alarm(&self) -> Result<()> {
        let existing = self.alarms.alarm_names().await?;
        for name in existing {
            if LEGACY_ALARMS.contains(&name.as_str()) {
                info!("Clearing legacy alarm '{}'", name);
                self.alarms.clear(&name).await?;
            }
        }

        // Re-registering replaces a duplicate tick alarm
        self.alarms
            .create(TICK_ALARM, self.config.tick_interval_minutes)
            .await
    }

    fn spawn_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.events_rx.clone();
        let alarms = self.alarm_events.clone();
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut alarms_open = true;
            loop {
                tokio::select! {
                    event = events.recv_async() => {
                        let Ok(event) = event else {
                            debug!("Event channel closed, stopping pump");
                            break;
                        };
                        let Some(state) = weak.upgrade() else { break };
                        state.handle_event(event).await;
                    }
                    alarm = alarms.recv_async(), if alarms_open => {
                        let Ok(name) = alarm else {
                            warn!("Alarm channel closed, maintenance ticks stopped");
                            alarms_open = false;
                            continue;
                        };
                        let Some(state) = weak.upgrade() else { break };
                        // Ticks can take a while; keep draining events meanwhile
                        let tick_state = state.clone();
                        state.track(tokio::spawn(async move { tick_state.on_alarm(&name).await }));
                    }
                }
            }
        })
    }

    /// Translate and enqueue one host event. Returns how many entries were merged.
    pub async fn handle_event(self: &Arc<Self>, event: MutationEvent) -> usize {
        let event_type = event.type_str();
        let mut merged = 0;

        for planned in plan_updates(event) {
            let result = self
                .queue
                .enqueue(
                    planned.kind,
                    &planned.document,
                    self.store.as_ref(),
                    planned.reindex,
                    self.clock.now(),
                )
                .await;

            match result {
                Ok(_) => merged += 1,
                Err(e @ SyncError::KeyDerivation(_)) => {
                    warn!("Dropping {} event: {}", event_type, e);
                }
                Err(e) => {
                    warn!("Failed to queue {} event: {}", event_type, e);
                }
            }
        }

        if merged > 0 {
            self.schedule_persist();
            if !self.in_backoff.load(Ordering::SeqCst) {
                self.schedule_batch(self.config.batch_debounce());
            }
        }
        merged
    }

    pub async fn on_alarm(self: &Arc<Self>, name: &str) {
        if name != TICK_ALARM {
            debug!("Ignoring alarm '{}'", name);
            return;
        }
        match self.run_maintenance_tick().await {
            TickOutcome::Failed(e) => error!("Maintenance tick failed: {}", e),
            outcome => debug!("Maintenance tick: {:?}", outcome),
        }
    }

    fn schedule_batch(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.batch_task.schedule(delay, move || async move {
            if let Some(state) = weak.upgrade() {
                state.process_batch().await;
            }
        });
    }

    fn schedule_persist(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.persist_task
            .schedule(self.config.persist_debounce(), move || async move {
                if let Some(state) = weak.upgrade() {
                    if let Err(e) = state.persist_snapshot().await {
                        error!("Failed to persist queue snapshot: {}", e);
                    }
                }
            });
    }

    pub async fn persist_snapshot(&self) -> Result<usize> {
        let saved = self
            .queue
            .save_snapshot(self.kv.as_ref(), self.config.snapshot_cap)
            .await?;
        debug!("Persisted queue snapshot with {} entries", saved);
        Ok(saved)
    }

    /// Run one batch unless one is already running, then schedule the next
    pub async fn process_batch(self: &Arc<Self>) -> BatchRun {
        let Some(guard) = FlagGuard::acquire(&self.processing) else {
            debug!("Batch already running, skipping");
            return BatchRun::Skipped;
        };

        let pipeline = Pipeline {
            queue: &self.queue,
            store: self.store.as_ref(),
            engine: self.engine.as_ref(),
            clock: self.clock.as_ref(),
        };
        let result = pipeline.run(self.config.batch_size).await;

        let run = match result {
            Ok(outcome) => {
                self.in_backoff.store(false, Ordering::SeqCst);
                *self.last_error.lock().await = None;

                if self.no_progress.record(&outcome) {
                    let dropped = drop_stuck_entries(&self.queue).await;
                    warn!(
                        "Queue stuck for {} runs, dropped {} failing entries",
                        self.config.max_consecutive_no_progress,
                        dropped.len()
                    );
                }
                BatchRun::Completed(outcome)
            }
            Err(e) => {
                self.in_backoff.store(true, Ordering::SeqCst);
                if e.is_engine_failure() {
                    warn!(
                        "Engine unavailable, retrying batch in {:?}: {}",
                        self.config.error_backoff(),
                        e
                    );
                } else {
                    error!(
                        "Batch run failed, retrying in {:?}: {}",
                        self.config.error_backoff(),
                        e
                    );
                }
                *self.last_error.lock().await = Some(e.clone());
                BatchRun::Failed(e)
            }
        };
        drop(guard);

        self.schedule_persist();
        if matches!(run, BatchRun::Failed(_)) {
            self.schedule_batch(self.config.error_backoff());
        } else if !self.queue.is_empty().await {
            self.schedule_batch(self.config.batch_debounce());
        }
        run
    }

    /// Pick the widest due tier and run it, unless anything else is running
    pub async fn run_maintenance_tick(self: &Arc<Self>) -> TickOutcome {
        if self.processing.load(Ordering::SeqCst) {
            info!("Batch in progress, skipping maintenance tick");
            return TickOutcome::Busy;
        }
        let Some(_guard) = FlagGuard::acquire(&self.maintenance_running) else {
            info!("Maintenance already running, skipping tick");
            return TickOutcome::Busy;
        };

        let tier = match self.scheduler.select_due(self.clock.now()) {
            Ok(Some(tier)) => tier,
            Ok(None) => {
                debug!("No maintenance tier due");
                return TickOutcome::NotDue;
            }
            Err(e) => return TickOutcome::Failed(e),
        };

        let mut record = MaintenanceRunRecord::new(tier.name, self.clock.now());
        let scan = MaintenanceScan {
            store: self.store.as_ref(),
            engine: self.engine.as_ref(),
            queue: &self.queue,
            clock: self.clock.as_ref(),
            limits: ScanLimits::from(&self.config),
        };
        scan.run(&tier, &mut record).await;
        let scan_complete = record.errors.is_empty();

        let compaction = compact(self.engine.as_ref(), &self.config.compaction).await;
        if let Some(e) = compaction.error {
            record.errors.push(format!("compaction: {}", e));
        }
        record.compaction = Some(compaction.summary);

        match self.engine.stats().await {
            Ok(stats) => *self.last_stats.lock().await = Some(stats),
            Err(e) => debug!("Engine stats unavailable: {}", e),
        }

        if scan_complete {
            if let Err(e) = self.scheduler.apply_coverage(tier.name, self.clock.now()) {
                error!("Failed to record maintenance coverage: {}", e);
            }
        } else {
            warn!(
                "Maintenance tier {} finished with errors {:?}, will retry next tick",
                tier.name.as_str(),
                record.errors
            );
        }

        {
            let mut history = self.history.lock().await;
            history.push(record.clone());
            if let Err(e) = history.save(self.kv.as_ref()) {
                warn!("Failed to persist maintenance history: {}", e);
            }
        }

        if record.corrected_indexed > 0 {
            self.schedule_persist();
            if !self.in_backoff.load(Ordering::SeqCst) {
                self.schedule_batch(self.config.batch_debounce());
            }
        }

        TickOutcome::Ran(record)
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.queue.len().await,
            failed: self.queue.failed_count().await,
            oldest_enqueued_at: self.queue.oldest_enqueued_at().await,
            processing: self.processing.load(Ordering::SeqCst),
            in_backoff: self.in_backoff.load(Ordering::SeqCst),
            consecutive_no_progress: self.no_progress.value(),
            next_batch_delay_ms: if self.batch_task.is_pending() {
                self.batch_task.last_delay().map(|d| d.as_millis() as u64)
            } else {
                None
            },
            last_error: self.last_error.lock().await.clone(),
        }
    }

    pub async fn get_maintenance_status(&self) -> Result<MaintenanceStatus> {
        Ok(MaintenanceStatus {
            running: self.maintenance_running.load(Ordering::SeqCst),
            tiers: self.scheduler.tier_statuses(self.clock.now())?,
            history: self.history.lock().await.records(),
            engine: self.last_stats.lock().await.clone(),
        })
    }

    /// Set a tier override in the settings store
    pub fn set_tier_override(
        &self,
        name: TierName,
        enabled: Option<bool>,
        interval_minutes: Option<u32>,
    ) -> Result<()> {
        self.scheduler.set_override(name, enabled, interval_minutes)
    }
}
