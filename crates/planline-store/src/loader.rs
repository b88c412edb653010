//! Startup hydration.

use std::collections::HashMap;

use planline_core::{Calendar, EventKind, Task, TaskEvent, TaskId};
use tracing::{info, instrument, warn};

use crate::database::Database;
use crate::error::StoreError;
use crate::event_log::EventLog;
use crate::snapshots;
use crate::task_table::TaskTable;

/// Everything a task store needs to start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadedState {
    pub tasks: Vec<Task>,
    pub calendar: Calendar,
}

pub struct DataLoader {
    db: Database,
}

impl DataLoader {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read the materialized tables. This is the normal startup path.
    #[instrument(skip(self))]
    pub fn load_data(&self) -> Result<LoadedState, StoreError> {
        self.db.with_conn(|conn| {
            let tasks = TaskTable::load_all(conn)?;
            let calendar = TaskTable::load_calendar(conn)?.unwrap_or_default();
            info!(tasks = tasks.len(), "loaded task table");
            Ok(LoadedState { tasks, calendar })
        })
    }

    /// Reconstruct state from the latest snapshot plus the log tail, then
    /// rewrite the materialized tables to match.
    #[instrument(skip(self))]
    pub fn rebuild_from_log(&self) -> Result<LoadedState, StoreError> {
        self.db.with_tx(|tx| {
            let snapshot = snapshots::load_latest(tx)?;
            let (mut state, anchor) = match snapshot {
                Some(snap) => (
                    Replay::new(snap.tasks, snap.calendar),
                    snap.event_id,
                ),
                None => (Replay::default(), None),
            };

            let tail = EventLog::list_after(tx, anchor.as_ref())?;
            let replayed = tail.len();
            for stored in &tail {
                state.apply(&stored.event);
            }

            let loaded = state.finish();
            TaskTable::replace_all(tx, &loaded.tasks)?;
            TaskTable::save_calendar(tx, &loaded.calendar)?;
            info!(
                replayed,
                tasks = loaded.tasks.len(),
                "rebuilt materialized tables from event log"
            );
            Ok(loaded)
        })
    }
}

/// In-order event replay keyed by task id.
#[derive(Default)]
struct Replay {
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
    calendar: Calendar,
}

impl Replay {
    fn new(tasks: Vec<Task>, calendar: Calendar) -> Self {
        let order = tasks.iter().map(|t| t.id.clone()).collect();
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            order,
            tasks,
            calendar,
        }
    }

    fn apply(&mut self, event: &TaskEvent) {
        match &event.kind {
            EventKind::TaskCreated(task) => {
                if self.tasks.insert(task.id.clone(), (**task).clone()).is_none() {
                    self.order.push(task.id.clone());
                }
            }
            EventKind::TaskUpdated(change) => match self.tasks.get_mut(&event.task_id()) {
                Some(task) => task.apply_change(change),
                None => warn!(target_id = %event.target_id, "update for unknown task skipped"),
            },
            EventKind::TaskDeleted {} => {
                let id = event.task_id();
                if self.tasks.remove(&id).is_some() {
                    self.order.retain(|existing| existing != &id);
                }
            }
            EventKind::CalendarUpdated(calendar) => self.calendar = calendar.clone(),
            EventKind::ProjectImported { .. } => {}
        }
    }

    fn finish(mut self) -> LoadedState {
        let tasks = self
            .order
            .iter()
            .filter_map(|id| self.tasks.remove(id))
            .collect();
        LoadedState {
            tasks,
            calendar: self.calendar,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceService;
    use crate::snapshots::SnapshotService;
    use chrono::Weekday;
    use planline_core::{EventSink, FieldChange};

    fn rename(id: &str, old: &str, new: &str) -> TaskEvent {
        TaskEvent::updated(
            &TaskId::from_raw(id),
            FieldChange::Name {
                old_value: old.into(),
                new_value: new.into(),
            },
        )
    }

    #[test]
    fn empty_database_loads_defaults() {
        let loader = DataLoader::new(Database::in_memory().unwrap());
        let state = loader.load_data().unwrap();
        assert!(state.tasks.is_empty());
        assert_eq!(state.calendar, Calendar::default());
    }

    #[test]
    fn flushed_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.db");
        {
            let persistence = PersistenceService::new(Database::open(&path).unwrap());
            persistence.queue_event(TaskEvent::created(Task::new("A", "Design")));
            persistence.queue_event(TaskEvent::created(Task::new("B", "Build")));
            persistence.queue_event(rename("A", "Design", "Design review"));
            persistence.flush_now().unwrap();
        }

        let state = DataLoader::new(Database::open(&path).unwrap()).load_data().unwrap();
        let names: Vec<&str> = state.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Design review", "Build"]);
    }

    #[test]
    fn rebuild_without_snapshot_replays_whole_log() {
        let db = Database::in_memory().unwrap();
        let persistence = PersistenceService::new(db.clone());
        persistence.queue_event(TaskEvent::created(Task::new("A", "Design")));
        persistence.queue_event(TaskEvent::created(Task::new("B", "Build")));
        persistence.queue_event(TaskEvent::deleted(&TaskId::from_raw("A")));
        persistence.flush_now().unwrap();

        // Corrupt the projection; the log is the source of truth.
        db.with_conn(|c| Ok(c.execute_batch("DELETE FROM tasks")?)).unwrap();

        let state = DataLoader::new(db.clone()).rebuild_from_log().unwrap();
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].id.as_str(), "B");
        assert_eq!(db.with_conn(TaskTable::count).unwrap(), 1);
    }

    #[test]
    fn rebuild_starts_from_latest_snapshot() {
        let db = Database::in_memory().unwrap();
        let persistence = PersistenceService::new(db.clone());
        persistence.queue_event(TaskEvent::created(Task::new("A", "Design")));
        persistence.flush_now().unwrap();

        let snapshots = SnapshotService::new(db.clone(), 100, 5);
        snapshots
            .create_snapshot(&[Task::new("A", "Design")], &Calendar::default())
            .unwrap();

        let mut four_day = Calendar::default();
        four_day.working_days.retain(|d| *d != Weekday::Fri);
        persistence.queue_event(rename("A", "Design", "Design v2"));
        persistence.queue_event(TaskEvent::calendar_updated(four_day.clone()));
        persistence.flush_now().unwrap();

        let state = DataLoader::new(db).rebuild_from_log().unwrap();
        assert_eq!(state.tasks[0].name, "Design v2");
        assert_eq!(state.calendar, four_day);
    }

    #[test]
    fn rebuild_matches_fast_path() {
        let db = Database::in_memory().unwrap();
        let persistence = PersistenceService::new(db.clone());
        for (id, name) in [("A", "One"), ("B", "Two"), ("C", "Three")] {
            persistence.queue_event(TaskEvent::created(Task::new(id, name)));
        }
        persistence.queue_event(TaskEvent::updated(
            &TaskId::from_raw("C"),
            FieldChange::ParentId {
                old_value: None,
                new_value: Some(TaskId::from_raw("A")),
            },
        ));
        persistence.flush_now().unwrap();

        let loader = DataLoader::new(db);
        let fast = loader.load_data().unwrap();
        let rebuilt = loader.rebuild_from_log().unwrap();
        assert_eq!(fast, rebuilt);
    }
}
