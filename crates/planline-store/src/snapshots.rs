//! Periodic checkpoints of the full task set.
//!
//! A snapshot records every task plus the calendar together with the id of
//! the newest logged event it covers. Rebuilding replays only the events
//! logged after that id.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use planline_core::{Calendar, EventId, Task};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument};

use crate::database::Database;
use crate::error::StoreError;
use crate::event_log::EventLog;
use crate::row_helpers;

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotRecord {
    /// Newest event included; `None` for a snapshot of an empty log.
    pub event_id: Option<EventId>,
    pub tasks: Vec<Task>,
    pub calendar: Calendar,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotService {
    db: Database,
    threshold: u64,
    retain: u32,
    since_last: Mutex<u64>,
}

impl SnapshotService {
    pub fn new(db: Database, threshold: u64, retain: u32) -> Self {
        Self {
            db,
            threshold: threshold.max(1),
            retain: retain.max(1),
            since_last: Mutex::new(0),
        }
    }

    /// Seed the counter with the events logged after the newest snapshot, so
    /// the threshold spans process restarts. Returns the seeded count.
    #[instrument(skip(self))]
    pub fn resume(&self) -> Result<u64, StoreError> {
        let since = self.db.with_conn(|conn| {
            let anchor = load_latest(conn)?.and_then(|snap| snap.event_id);
            EventLog::count_after(conn, anchor.as_ref())
        })?;
        let since = u64::try_from(since).unwrap_or(0);
        *self.since_last.lock() = since;
        Ok(since)
    }

    /// Events persisted since the last snapshot.
    pub fn events_since_snapshot(&self) -> u64 {
        *self.since_last.lock()
    }

    /// Count `persisted` events and snapshot once the threshold is reached.
    ///
    /// `tasks` and `calendar` must reflect at least every persisted event.
    pub fn on_events_persisted(
        &self,
        persisted: usize,
        tasks: &[Task],
        calendar: &Calendar,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let due = {
            let mut since = self.since_last.lock();
            *since += persisted as u64;
            *since >= self.threshold
        };
        if !due {
            return Ok(None);
        }
        self.create_snapshot(tasks, calendar).map(Some)
    }

    /// Write a snapshot now and prune old ones.
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    pub fn create_snapshot(
        &self,
        tasks: &[Task],
        calendar: &Calendar,
    ) -> Result<SnapshotRecord, StoreError> {
        let tasks: Vec<Task> = tasks.iter().map(Task::stripped).collect();
        let record = self.db.with_tx(|tx| {
            let record = SnapshotRecord {
                event_id: EventLog::latest_id(tx)?,
                tasks,
                calendar: calendar.clone(),
                created_at: Utc::now(),
            };
            let _ = tx.execute(
                "INSERT INTO snapshots (event_id, tasks_json, calendar_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.event_id.as_ref().map(EventId::as_str),
                    serde_json::to_string(&record.tasks)?,
                    serde_json::to_string(&record.calendar)?,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            let pruned = tx.execute(
                "DELETE FROM snapshots WHERE rowid NOT IN
                 (SELECT rowid FROM snapshots ORDER BY rowid DESC LIMIT ?1)",
                [self.retain],
            )?;
            if pruned > 0 {
                tracing::debug!(pruned, "pruned old snapshots");
            }
            Ok(record)
        })?;

        *self.since_last.lock() = 0;
        info!(
            event_id = ?record.event_id,
            tasks = record.tasks.len(),
            "snapshot created"
        );
        Ok(record)
    }

    pub fn latest(&self) -> Result<Option<SnapshotRecord>, StoreError> {
        self.db.with_conn(load_latest)
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|c| Ok(c.query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?))
    }
}

pub(crate) fn load_latest(conn: &Connection) -> Result<Option<SnapshotRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT event_id, tasks_json, calendar_json, created_at
             FROM snapshots ORDER BY rowid DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((event_id, tasks_raw, calendar_raw, created_raw)) = row else {
        return Ok(None);
    };
    Ok(Some(SnapshotRecord {
        event_id: event_id.map(EventId::from_raw),
        tasks: row_helpers::parse_json(&tasks_raw, "snapshots", "tasks_json")?,
        calendar: row_helpers::parse_json(&calendar_raw, "snapshots", "calendar_json")?,
        created_at: row_helpers::parse_timestamp(&created_raw, "snapshots", "created_at")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistenceService;
    use planline_core::{EventSink, TaskEvent, TaskId};

    fn tasks(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| Task::new(TaskId::from_raw(format!("T{i}")), format!("Task {i}")))
            .collect()
    }

    #[test]
    fn below_threshold_does_nothing() {
        let db = Database::in_memory().unwrap();
        let svc = SnapshotService::new(db, 1000, 5);
        let snap = svc.on_events_persisted(600, &tasks(2), &Calendar::default()).unwrap();
        assert!(snap.is_none());
        assert_eq!(svc.events_since_snapshot(), 600);
        assert_eq!(svc.count().unwrap(), 0);
    }

    #[test]
    fn crossing_threshold_snapshots_and_resets() {
        let db = Database::in_memory().unwrap();
        let svc = SnapshotService::new(db, 1000, 5);
        let cal = Calendar::default();
        assert!(svc.on_events_persisted(600, &tasks(3), &cal).unwrap().is_none());

        let snap = svc.on_events_persisted(500, &tasks(3), &cal).unwrap().unwrap();
        assert_eq!(snap.tasks.len(), 3);
        assert_eq!(svc.events_since_snapshot(), 0);
        assert_eq!(svc.count().unwrap(), 1);
    }

    #[test]
    fn resume_counts_events_after_latest_snapshot() {
        let db = Database::in_memory().unwrap();
        let persistence = PersistenceService::new(db.clone());
        persistence.queue_event(TaskEvent::created(Task::new("A", "Design")));
        persistence.flush_now().unwrap();

        let first = SnapshotService::new(db.clone(), 10, 5);
        assert_eq!(first.resume().unwrap(), 1);
        first.create_snapshot(&tasks(1), &Calendar::default()).unwrap();

        persistence.queue_event(TaskEvent::created(Task::new("B", "Build")));
        persistence.queue_event(TaskEvent::deleted(&TaskId::from_raw("A")));
        persistence.flush_now().unwrap();

        let reopened = SnapshotService::new(db, 3, 5);
        assert_eq!(reopened.resume().unwrap(), 2);
        assert_eq!(reopened.events_since_snapshot(), 2);
        let snap = reopened
            .on_events_persisted(1, &tasks(1), &Calendar::default())
            .unwrap();
        assert!(snap.is_some());
    }

    #[test]
    fn snapshot_points_at_latest_logged_event() {
        let db = Database::in_memory().unwrap();
        let persistence = PersistenceService::new(db.clone());
        persistence.queue_event(TaskEvent::created(Task::new("A", "Design")));
        let last = persistence.queue(TaskEvent::created(Task::new("B", "Build")));
        persistence.flush_now().unwrap();

        let svc = SnapshotService::new(db, 10, 5);
        let snap = svc.create_snapshot(&tasks(2), &Calendar::default()).unwrap();
        assert_eq!(snap.event_id, Some(last));
        assert_eq!(svc.latest().unwrap(), Some(snap));
    }

    #[test]
    fn old_snapshots_are_pruned() {
        let db = Database::in_memory().unwrap();
        let svc = SnapshotService::new(db, 1, 2);
        for n in 1..=4 {
            svc.create_snapshot(&tasks(n), &Calendar::default()).unwrap();
        }
        assert_eq!(svc.count().unwrap(), 2);
        assert_eq!(svc.latest().unwrap().unwrap().tasks.len(), 4);
    }

    #[test]
    fn latest_on_empty_database() {
        let svc = SnapshotService::new(Database::in_memory().unwrap(), 10, 5);
        assert_eq!(svc.latest().unwrap(), None);
    }
}
