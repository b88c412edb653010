//! The application context.
//!
//! A [`Planner`] owns one task store and everything wired to it: the
//! operation queue that serializes mutations, write-behind persistence,
//! snapshots and an optional scheduling engine. Every async method submits
//! exactly one closure to the queue; the store mutex is taken only inside
//! that closure and never held across an `.await`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use planline_core::{
    Calendar, EventSink, PlanlineSettings, Task, TaskEvent, TaskId, TaskPatch,
};
use planline_store::{Database, DataLoader, FlushReport, PersistenceService, SnapshotService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::ScheduleEngine;
use crate::error::{PlannerError, ValidationError};
use crate::history::HistoryState;
use crate::queue::OperationQueue;
use crate::store::TaskStore;
use crate::validation::{self, OperationResult};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub struct Planner {
    store: Arc<Mutex<TaskStore>>,
    queue: OperationQueue,
    persistence: Arc<PersistenceService>,
    snapshots: Arc<SnapshotService>,
    engine: Option<Arc<dyn ScheduleEngine>>,
    flush_interval: Duration,
    cancel: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Planner {
    /// Wire a store to persistence. Must be called inside a tokio runtime.
    pub fn new(
        mut store: TaskStore,
        persistence: Arc<PersistenceService>,
        snapshots: Arc<SnapshotService>,
    ) -> Self {
        let sink: Arc<dyn EventSink> = persistence.clone();
        store.set_sink(Some(sink));
        Self {
            store: Arc::new(Mutex::new(store)),
            queue: OperationQueue::new(),
            persistence,
            snapshots,
            engine: None,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    /// Hydrate from `db` and build a planner configured by `settings`.
    #[instrument(skip_all, fields(db = %db.path().display()))]
    pub fn open(db: Database, settings: &PlanlineSettings) -> Result<Self, PlannerError> {
        let loaded = DataLoader::new(db.clone()).load_data()?;
        let mut store = TaskStore::new(settings.history.max_history);
        store.hydrate(loaded.tasks, loaded.calendar);

        let persistence = Arc::new(PersistenceService::new(db.clone()));
        let snapshots = Arc::new(SnapshotService::new(
            db,
            settings.snapshots.threshold,
            settings.snapshots.retain,
        ));
        let since_snapshot = snapshots.resume()?;
        debug!(since_snapshot, "snapshot counter resumed");
        Ok(Self::new(store, persistence, snapshots).with_flush_interval(Duration::from_millis(
            settings.persistence.flush_interval_ms,
        )))
    }

    pub fn with_engine(mut self, engine: Arc<dyn ScheduleEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval.max(Duration::from_millis(1));
        self
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<Mutex<TaskStore>> {
        &self.store
    }

    pub fn persistence(&self) -> &Arc<PersistenceService> {
        &self.persistence
    }

    pub fn snapshots(&self) -> &Arc<SnapshotService> {
        &self.snapshots
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.store.lock().get(id).cloned()
    }

    /// Every task, parents before children, siblings in visual order.
    pub fn outline(&self) -> Vec<Task> {
        let store = self.store.lock();
        let mut out = Vec::with_capacity(store.len());
        let mut stack: Vec<&Task> = store.children(None).into_iter().rev().collect();
        while let Some(task) = stack.pop() {
            stack.extend(store.children(Some(&task.id)).into_iter().rev());
            out.push(task.clone());
        }
        out
    }

    pub fn calendar(&self) -> Calendar {
        self.store.lock().calendar().clone()
    }

    pub fn history_state(&self) -> HistoryState {
        self.store.lock().history().state()
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Add a task directly below `after`, or by its own `sort_key` (empty
    /// appends) when `after` is `None`.
    pub async fn add_task(
        &self,
        task: Task,
        after: Option<TaskId>,
    ) -> Result<OperationResult, PlannerError> {
        self.mutate(move |store| {
            let checked = validation::validate_new_task(store, &task).and_then(|()| {
                validation::validate_anchor(store, task.parent_id.as_ref(), after.as_ref())
            });
            if let Err(e) = checked {
                return Ok(OperationResult::from(e));
            }
            let id = match after {
                Some(after) => store.insert_after(task, Some(&after))?,
                None => store.add(task)?,
            };
            Ok(OperationResult::ok("Task added").with_task(id))
        })
        .await
    }

    /// Append a new task named `name` at the end of `parent`'s group.
    pub async fn append_task(
        &self,
        name: impl Into<String>,
        parent: Option<TaskId>,
    ) -> Result<OperationResult, PlannerError> {
        let mut task = Task::new(TaskId::new(), name);
        task.parent_id = parent;
        self.add_task(task, None).await
    }

    pub async fn update_task(
        &self,
        id: TaskId,
        patch: TaskPatch,
    ) -> Result<OperationResult, PlannerError> {
        self.mutate(move |store| {
            if let Err(e) = validation::validate_patch(store, &id, &patch) {
                return Ok(OperationResult::from(e));
            }
            let changed = store.update(&id, &patch)?;
            Ok(OperationResult::ok(format!("{changed} field(s) updated")).with_task(id))
        })
        .await
    }

    pub async fn delete_task(
        &self,
        id: TaskId,
        cascade: bool,
    ) -> Result<OperationResult, PlannerError> {
        self.mutate(move |store| {
            if !store.contains(&id) {
                return Ok(OperationResult::from(ValidationError::UnknownTask(id)));
            }
            let removed = store.delete(&id, cascade)?;
            Ok(OperationResult::ok(format!("{removed} task(s) deleted")))
        })
        .await
    }

    pub async fn move_task(
        &self,
        id: TaskId,
        new_parent: Option<TaskId>,
        after: Option<TaskId>,
    ) -> Result<OperationResult, PlannerError> {
        self.mutate(move |store| {
            let checked =
                validation::validate_move(store, &id, new_parent.as_ref(), after.as_ref());
            if let Err(e) = checked {
                return Ok(OperationResult::from(e));
            }
            let moved = store.move_task(&id, new_parent, after.as_ref())?;
            let message = if moved { "Task moved" } else { "Task already in place" };
            Ok(OperationResult::ok(message).with_task(id))
        })
        .await
    }

    pub async fn create_blank_row(
        &self,
        parent: Option<TaskId>,
    ) -> Result<OperationResult, PlannerError> {
        self.mutate(move |store| {
            if let Some(parent) = &parent {
                if !store.contains(parent) {
                    return Ok(OperationResult::from(ValidationError::UnknownParent(
                        parent.clone(),
                    )));
                }
            }
            let id = store.create_blank_row(None, parent)?;
            Ok(OperationResult::ok("Row added").with_task(id))
        })
        .await
    }

    pub async fn wake_up_blank_row(
        &self,
        id: TaskId,
        name: Option<String>,
    ) -> Result<Option<Task>, PlannerError> {
        self.mutate(move |store| Ok(store.wake_up_blank_row(&id, name)))
            .await
    }

    pub async fn revert_to_blank_row(&self, id: TaskId) -> Result<bool, PlannerError> {
        self.mutate(move |store| Ok(store.revert_to_blank_row(&id)))
            .await
    }

    pub async fn undo(&self) -> Result<bool, PlannerError> {
        self.mutate(|store| Ok(store.undo().is_some())).await
    }

    pub async fn redo(&self) -> Result<bool, PlannerError> {
        self.mutate(|store| Ok(store.redo().is_some())).await
    }

    pub async fn set_calendar(&self, calendar: Calendar) -> Result<bool, PlannerError> {
        self.mutate(move |store| Ok(store.set_calendar(calendar)))
            .await
    }

    /// Create a batch of tasks as one undoable step, closed by a
    /// `PROJECT_IMPORTED` marker. The batch is validated up front; a failure
    /// leaves the store as it was.
    pub async fn import_tasks(
        &self,
        source: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Result<usize, PlannerError> {
        let source = source.into();
        self.mutate(move |store| {
            validation::validate_import(store, &tasks)
                .map_err(|e| PlannerError::ImportRejected(e.to_string()))?;
            let count = tasks.len();
            store.begin_composite(format!("Import {source}"))?;
            if let Err(e) = import_batch(store, &source, tasks) {
                let reverted = store.cancel_composite()?;
                warn!(error = %e, reverted, "import failed, changes reverted");
                return Err(e);
            }
            let _ = store.end_composite()?;
            info!(%source, count, "project imported");
            Ok(count)
        })
        .await
    }

    /// Run the scheduling engine now. `Ok(false)` when there is no engine or
    /// it failed.
    pub async fn recalculate(&self) -> Result<bool, PlannerError> {
        let Some(engine) = self.engine.clone() else {
            return Ok(false);
        };
        let store = Arc::clone(&self.store);
        let ran = self
            .queue
            .run(move || run_engine(&mut store.lock(), engine.as_ref()))
            .await?;
        Ok(ran)
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write buffered events now. Queued behind pending mutations.
    pub async fn flush(&self) -> Result<FlushReport, PlannerError> {
        let job = self.flush_job();
        self.queue.run(move || job.run()).await?
    }

    /// Start periodic background flushing.
    pub fn spawn_flush_loop(&self) {
        let mut slot = self.flush_task.lock();
        if slot.is_some() {
            return;
        }
        let job = self.flush_job();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let period = self.flush_interval;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if job.persistence.pending() == 0 {
                            continue;
                        }
                        let run = job.clone();
                        match queue.run(move || run.run()).await {
                            Ok(Ok(report)) => debug!(persisted = report.persisted, "background flush"),
                            Ok(Err(e)) => warn!(error = %e, "background flush failed, will retry"),
                            Err(e) => {
                                warn!(error = %e, "flush loop stopping");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("flush loop stopped");
        }));
    }

    /// Stop the flush loop and write whatever is still buffered.
    pub async fn shutdown(&self) -> Result<FlushReport, PlannerError> {
        self.cancel.cancel();
        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "flush loop ended abnormally");
            }
        }
        let report = self.flush().await?;
        info!(persisted = report.persisted, "planner shut down");
        Ok(report)
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Queue `op` against the store, then recalculate when an engine is set.
    async fn mutate<T, F>(&self, op: F) -> Result<T, PlannerError>
    where
        F: FnOnce(&mut TaskStore) -> Result<T, PlannerError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let engine = self.engine.clone();
        self.queue
            .run(move || {
                let mut store = store.lock();
                let out = op(&mut store)?;
                if let Some(engine) = &engine {
                    let _ = run_engine(&mut store, engine.as_ref());
                }
                Ok(out)
            })
            .await?
    }

    fn flush_job(&self) -> FlushJob {
        FlushJob {
            store: Arc::clone(&self.store),
            persistence: Arc::clone(&self.persistence),
            snapshots: Arc::clone(&self.snapshots),
        }
    }
}

fn import_batch(store: &mut TaskStore, source: &str, tasks: Vec<Task>) -> Result<(), PlannerError> {
    let count = tasks.len();
    for task in tasks {
        let _ = store.add(task)?;
    }
    store.record_marker(TaskEvent::project_imported(source, count));
    Ok(())
}

fn run_engine(store: &mut TaskStore, engine: &dyn ScheduleEngine) -> bool {
    let tasks = store.get_schedulable_tasks();
    match engine.schedule(&tasks, store.calendar()) {
        Ok(results) => {
            let merged = store.merge_schedule(results);
            debug!(merged, "schedule merged");
            true
        }
        Err(e) => {
            warn!(error = %e, "schedule recalculation failed");
            false
        }
    }
}

/// One flush followed by snapshot bookkeeping. Runs on the queue, so the
/// store it reads matches exactly what was just persisted.
#[derive(Clone)]
struct FlushJob {
    store: Arc<Mutex<TaskStore>>,
    persistence: Arc<PersistenceService>,
    snapshots: Arc<SnapshotService>,
}

impl FlushJob {
    fn run(&self) -> Result<FlushReport, PlannerError> {
        let report = self.persistence.flush_now()?;
        if report.persisted > 0 {
            let store = self.store.lock();
            if let Err(e) =
                self.snapshots
                    .on_events_persisted(report.persisted, store.tasks(), store.calendar())
            {
                warn!(error = %e, "snapshot failed");
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScheduleResult;
    use crate::error::EngineError;
    use planline_core::Schedule;
    use planline_store::EventLog;

    fn planner() -> Planner {
        let db = Database::in_memory().unwrap();
        Planner::open(db, &PlanlineSettings::default()).unwrap()
    }

    fn id(raw: &str) -> TaskId {
        TaskId::from_raw(raw)
    }

    struct LevelEngine;

    impl ScheduleEngine for LevelEngine {
        fn schedule(
            &self,
            tasks: &[Task],
            _calendar: &Calendar,
        ) -> Result<Vec<ScheduleResult>, EngineError> {
            Ok(tasks
                .iter()
                .map(|t| ScheduleResult {
                    id: t.id.clone(),
                    schedule: Schedule {
                        level: t.display_order,
                        ..Schedule::default()
                    },
                })
                .collect())
        }
    }

    struct BrokenEngine;

    impl ScheduleEngine for BrokenEngine {
        fn schedule(&self, _: &[Task], _: &Calendar) -> Result<Vec<ScheduleResult>, EngineError> {
            Err(EngineError::Cycle("A".into()))
        }
    }

    #[tokio::test]
    async fn add_task_returns_id() {
        let planner = planner();
        let result = planner.add_task(Task::new("A", "Design"), None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.task_id, Some(id("A")));
        assert_eq!(planner.task(&id("A")).unwrap().display_order, 1);
        assert_eq!(planner.persistence().pending(), 1);
    }

    #[tokio::test]
    async fn rejected_input_changes_nothing() {
        let planner = planner();
        let mut task = Task::new("A", "Design");
        task.progress = 250.0;
        let result = planner.add_task(task, None).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("progress"));
        assert!(planner.task(&id("A")).is_none());
        assert_eq!(planner.persistence().pending(), 0);
        assert!(!planner.history_state().can_undo);
    }

    #[tokio::test]
    async fn update_and_delete_report_outcomes() {
        let planner = planner();
        planner.add_task(Task::new("A", "Design"), None).await.unwrap();

        let patch = TaskPatch {
            name: Some("Build".into()),
            ..TaskPatch::default()
        };
        let result = planner.update_task(id("A"), patch).await.unwrap();
        assert_eq!(result.message, "1 field(s) updated");
        assert_eq!(planner.task(&id("A")).unwrap().name, "Build");

        let missing = planner.delete_task(id("Q"), false).await.unwrap();
        assert!(!missing.success);

        let deleted = planner.delete_task(id("A"), true).await.unwrap();
        assert!(deleted.success);
        assert!(planner.task(&id("A")).is_none());
    }

    #[tokio::test]
    async fn outline_is_depth_first() {
        let planner = planner();
        planner.add_task(Task::new("P", "p"), None).await.unwrap();
        planner.add_task(Task::new("Q", "q"), None).await.unwrap();
        planner
            .add_task(Task::new("C", "c").with_parent("P"), None)
            .await
            .unwrap();
        let ids: Vec<String> = planner.outline().into_iter().map(|t| t.id.to_string()).collect();
        assert_eq!(ids, vec!["P", "C", "Q"]);
    }

    #[tokio::test]
    async fn engine_results_are_merged_after_mutations() {
        let planner = planner().with_engine(Arc::new(LevelEngine));
        planner.add_task(Task::new("A", "a"), None).await.unwrap();
        planner.add_task(Task::new("B", "b"), None).await.unwrap();
        assert_eq!(planner.task(&id("B")).unwrap().schedule.level, 2);
        assert!(planner.recalculate().await.unwrap());
    }

    #[tokio::test]
    async fn engine_failure_is_not_fatal() {
        let planner = planner().with_engine(Arc::new(BrokenEngine));
        let result = planner.add_task(Task::new("A", "a"), None).await.unwrap();
        assert!(result.success);
        assert!(planner.task(&id("A")).is_some());
        assert!(!planner.recalculate().await.unwrap());
    }

    #[tokio::test]
    async fn flush_persists_and_counts_towards_snapshot() {
        let db = Database::in_memory().unwrap();
        let mut settings = PlanlineSettings::default();
        settings.snapshots.threshold = 3;
        let planner = Planner::open(db.clone(), &settings).unwrap();

        planner.add_task(Task::new("A", "a"), None).await.unwrap();
        planner.add_task(Task::new("B", "b"), None).await.unwrap();
        let report = planner.flush().await.unwrap();
        assert_eq!(report.persisted, 2);
        assert_eq!(planner.snapshots().count().unwrap(), 0);

        planner.add_task(Task::new("C", "c"), None).await.unwrap();
        planner.flush().await.unwrap();
        let snapshot = planner.snapshots().latest().unwrap().unwrap();
        assert_eq!(snapshot.tasks.len(), 3);
        assert_eq!(db.with_conn(EventLog::count).unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_loop_drains_buffer() {
        let planner = planner().with_flush_interval(Duration::from_millis(50));
        planner.spawn_flush_loop();
        planner.add_task(Task::new("A", "a"), None).await.unwrap();
        assert_eq!(planner.persistence().pending(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(planner.persistence().pending(), 0);

        let report = planner.shutdown().await.unwrap();
        assert_eq!(report.persisted, 0);
    }

    #[tokio::test]
    async fn import_is_one_step() {
        let planner = planner();
        let batch = vec![
            Task::new("P", "phase"),
            Task::new("T1", "first").with_parent("P"),
            Task::new("T2", "second").with_parent("P"),
        ];
        assert_eq!(planner.import_tasks("legacy.json", batch).await.unwrap(), 3);
        assert_eq!(planner.outline().len(), 3);
        assert_eq!(
            planner.history_state().undo_label.as_deref(),
            Some("Import legacy.json")
        );
        assert_eq!(planner.persistence().pending(), 4);

        assert!(planner.undo().await.unwrap());
        assert!(planner.outline().is_empty());
    }

    #[tokio::test]
    async fn import_marker_is_written_once() {
        let db = Database::in_memory().unwrap();
        let planner = Planner::open(db.clone(), &PlanlineSettings::default()).unwrap();
        let batch = vec![Task::new("P", "phase"), Task::new("Q", "review")];
        planner.import_tasks("legacy.json", batch).await.unwrap();

        assert!(planner.undo().await.unwrap());
        assert!(planner.redo().await.unwrap());
        assert_eq!(planner.outline().len(), 2);
        planner.flush().await.unwrap();

        let log = db.with_conn(|c| EventLog::list(c, None, None)).unwrap();
        let markers = log
            .iter()
            .filter(|e| e.event.event_type() == "PROJECT_IMPORTED")
            .count();
        assert_eq!(markers, 1);
    }

    #[tokio::test]
    async fn blank_row_round_trip() {
        let planner = planner();
        let row = planner.create_blank_row(None).await.unwrap();
        let row_id = row.task_id.unwrap();
        let woken = planner
            .wake_up_blank_row(row_id.clone(), Some("Review".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(woken.name, "Review");
        assert!(planner.revert_to_blank_row(row_id.clone()).await.unwrap());
        assert!(planner.task(&row_id).unwrap().is_blank());

        let orphan = planner.create_blank_row(Some(id("ghost"))).await.unwrap();
        assert!(!orphan.success);
    }
}
