//! Append-only durable event log.
//!
//! Rows are never updated or deleted. Insertion uses `INSERT OR IGNORE` on
//! the event id, so re-flushing a batch after a failed commit cannot
//! duplicate entries. Log order is SQLite `rowid` order.

use planline_core::{EventId, TaskEvent};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::error::StoreError;
use crate::row_helpers;

/// An event as read back from the log.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    pub id: EventId,
    pub event: TaskEvent,
}

pub struct EventLog;

impl EventLog {
    /// Append one event. Returns `false` when the id was already logged.
    pub fn append(conn: &Connection, id: &EventId, event: &TaskEvent) -> Result<bool, StoreError> {
        let payload = event.payload()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO events (id, type, target_id, payload_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                event.event_type(),
                event.target_id,
                serde_json::to_string(&payload)?,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// List events in log order.
    #[instrument(skip(conn))]
    pub fn list(
        conn: &Connection,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT id, type, target_id, payload_json, timestamp
             FROM events ORDER BY rowid ASC LIMIT ?1 OFFSET ?2",
        )?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, i64::from);
        let mut rows = stmt.query(params![limit, offset.unwrap_or(0)])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_event(row)?);
        }
        Ok(results)
    }

    /// The newest `limit` events, newest last.
    pub fn tail(conn: &Connection, limit: u32) -> Result<Vec<StoredEvent>, StoreError> {
        let total = Self::count(conn)?;
        let offset = (total - i64::from(limit)).max(0);
        let offset = u32::try_from(offset).unwrap_or(u32::MAX);
        Self::list(conn, Some(limit), Some(offset))
    }

    /// Events logged strictly after `after`. `None` lists the whole log.
    #[instrument(skip(conn))]
    pub fn list_after(
        conn: &Connection,
        after: Option<&EventId>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let Some(after) = after else {
            return Self::list(conn, None, None);
        };

        let anchor: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM events WHERE id = ?1",
                [after.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let anchor = anchor.ok_or_else(|| StoreError::NotFound(format!("event {after}")))?;

        let mut stmt = conn.prepare(
            "SELECT id, type, target_id, payload_json, timestamp
             FROM events WHERE rowid > ?1 ORDER BY rowid ASC",
        )?;
        let mut rows = stmt.query([anchor])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(row_to_event(row)?);
        }
        Ok(results)
    }

    pub fn latest_id(conn: &Connection) -> Result<Option<EventId>, StoreError> {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM events ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(EventId::from_raw))
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
    }

    /// Number of events logged strictly after `after`. `None` counts the
    /// whole log.
    pub fn count_after(conn: &Connection, after: Option<&EventId>) -> Result<i64, StoreError> {
        let Some(after) = after else {
            return Self::count(conn);
        };
        let anchor: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM events WHERE id = ?1",
                [after.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let anchor = anchor.ok_or_else(|| StoreError::NotFound(format!("event {after}")))?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM events WHERE rowid > ?1",
            [anchor],
            |row| row.get(0),
        )?)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<StoredEvent, StoreError> {
    let id: String = row_helpers::get(row, 0, "events", "id")?;
    let event_type: String = row_helpers::get(row, 1, "events", "type")?;
    let target_id: String = row_helpers::get(row, 2, "events", "target_id")?;
    let payload_raw: String = row_helpers::get(row, 3, "events", "payload_json")?;
    let payload: serde_json::Value = row_helpers::parse_json(&payload_raw, "events", "payload_json")?;
    let timestamp_raw: String = row_helpers::get(row, 4, "events", "timestamp")?;
    let timestamp = row_helpers::parse_timestamp(&timestamp_raw, "events", "timestamp")?;

    let event = TaskEvent::from_parts(&event_type, target_id, payload, timestamp).map_err(|e| {
        StoreError::CorruptRow {
            table: "events",
            column: "payload_json",
            detail: format!("{event_type}: {e}"),
        }
    })?;

    Ok(StoredEvent {
        id: EventId::from_raw(id),
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use planline_core::{FieldChange, Task, TaskId};

    fn sample_events() -> Vec<(EventId, TaskEvent)> {
        let a = TaskId::from_raw("A");
        vec![
            (EventId::new(), TaskEvent::created(Task::new("A", "Design"))),
            (
                EventId::new(),
                TaskEvent::updated(
                    &a,
                    FieldChange::Name {
                        old_value: "Design".into(),
                        new_value: "Build".into(),
                    },
                ),
            ),
            (EventId::new(), TaskEvent::deleted(&a)),
        ]
    }

    fn seeded() -> (Database, Vec<(EventId, TaskEvent)>) {
        let db = Database::in_memory().unwrap();
        let events = sample_events();
        db.with_tx(|tx| {
            for (id, event) in &events {
                EventLog::append(tx, id, event)?;
            }
            Ok(())
        })
        .unwrap();
        (db, events)
    }

    #[test]
    fn append_and_list_in_order() {
        let (db, events) = seeded();
        let stored = db.with_conn(|c| EventLog::list(c, None, None)).unwrap();
        assert_eq!(stored.len(), 3);
        for (stored, (id, event)) in stored.iter().zip(&events) {
            assert_eq!(&stored.id, id);
            assert_eq!(&stored.event, event);
        }
    }

    #[test]
    fn duplicate_append_is_ignored() {
        let (db, events) = seeded();
        let (id, event) = &events[0];
        let inserted = db.with_conn(|c| EventLog::append(c, id, event)).unwrap();
        assert!(!inserted);
        assert_eq!(db.with_conn(EventLog::count).unwrap(), 3);
    }

    #[test]
    fn list_after_skips_prefix() {
        let (db, events) = seeded();
        let after = db
            .with_conn(|c| EventLog::list_after(c, Some(&events[0].0)))
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].id, events[1].0);
    }

    #[test]
    fn count_after_matches_list_after() {
        let (db, events) = seeded();
        let all = db.with_conn(|c| EventLog::count_after(c, None)).unwrap();
        assert_eq!(all, events.len() as i64);
        let after_first = db
            .with_conn(|c| EventLog::count_after(c, Some(&events[0].0)))
            .unwrap();
        assert_eq!(after_first, events.len() as i64 - 1);
    }

    #[test]
    fn list_after_unknown_event_is_not_found() {
        let (db, _) = seeded();
        let result = db.with_conn(|c| EventLog::list_after(c, Some(&EventId::new())));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn latest_and_tail() {
        let (db, events) = seeded();
        let latest = db.with_conn(EventLog::latest_id).unwrap();
        assert_eq!(latest.as_ref(), Some(&events[2].0));

        let tail = db.with_conn(|c| EventLog::tail(c, 2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].id, events[2].0);
    }

    #[test]
    fn malformed_payload_returns_error() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (id, type, target_id, payload_json, timestamp)
                 VALUES ('evt_x', 'TASK_CREATED', 'A', 'not valid json', '2024-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let result = db.with_conn(|c| EventLog::list(c, None, None));
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
