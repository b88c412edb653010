//! Write-behind persistence.
//!
//! Mutations reach this service as [`TaskEvent`]s through
//! [`EventSink::queue_event`], which only pushes onto an in-memory buffer.
//! [`PersistenceService::flush_now`] drains the buffer in a single SQLite
//! transaction that appends each event to the log and projects it onto the
//! materialized tables.
//!
//! # Delivery
//!
//! A failed flush puts the whole batch back in front of anything queued
//! meanwhile, so the next flush retries it in order. Log inserts ignore
//! duplicate ids and the projection is an idempotent upsert, which makes the
//! retry safe (at-least-once).
//!
//! Once an event has failed [`MAX_FLUSH_ATTEMPTS`] times the batch is written
//! one event at a time. An event that still fails on its own is moved to the
//! `dead_events` table so it cannot block the events behind it.
//!
//! Events that were queued but never flushed are lost if the process dies.
//! The exposure window is one flush interval plus the shutdown flush.

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::Mutex;
use planline_core::{EventId, EventSink, TaskEvent};
use rusqlite::{params, Connection};
use tracing::{debug, error, instrument, warn};

use crate::database::Database;
use crate::error::StoreError;
use crate::event_log::EventLog;
use crate::task_table::TaskTable;

/// Failed flushes an event may take part in before it is written on its own
/// and, failing that, dead-lettered.
pub const MAX_FLUSH_ATTEMPTS: u32 = 5;

/// A queued event with its durable id.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    pub id: EventId,
    pub event: TaskEvent,
    /// Failed flushes so far.
    pub attempts: u32,
}

/// Outcome of a successful flush.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushReport {
    /// Events committed by this flush.
    pub persisted: usize,
    pub last_event_id: Option<EventId>,
    /// Events moved to `dead_events` instead.
    pub dead_lettered: usize,
}

pub struct PersistenceService {
    db: Database,
    queue: Mutex<VecDeque<PendingEvent>>,
    /// Held for the duration of a flush so batches commit in queue order.
    flush_lock: Mutex<()>,
}

impl PersistenceService {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Buffer an event. O(1), never touches the database.
    pub fn queue(&self, event: TaskEvent) -> EventId {
        let id = EventId::new();
        self.queue.lock().push_back(PendingEvent {
            id: id.clone(),
            event,
            attempts: 0,
        });
        id
    }

    /// Buffer an event given as raw `type` / `target_id` / `payload` parts.
    pub fn queue_raw(
        &self,
        event_type: &str,
        target_id: &str,
        payload: serde_json::Value,
    ) -> Result<EventId, StoreError> {
        let event = TaskEvent::from_parts(event_type, target_id, payload, chrono::Utc::now())?;
        Ok(self.queue(event))
    }

    /// Number of events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Events that were given up on.
    pub fn dead_letter_count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|c| {
            Ok(c.query_row("SELECT COUNT(*) FROM dead_events", [], |row| row.get(0))?)
        })
    }

    /// Drain the buffer into the database.
    ///
    /// On error nothing is lost: unwritten events go back on the buffer.
    #[instrument(skip(self))]
    pub fn flush_now(&self) -> Result<FlushReport, StoreError> {
        let _flushing = self.flush_lock.lock();

        let mut batch: Vec<PendingEvent> = self.queue.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        match self.write_batch(&batch) {
            Ok(()) => {
                let report = FlushReport {
                    persisted: batch.len(),
                    last_event_id: batch.last().map(|p| p.id.clone()),
                    dead_lettered: 0,
                };
                debug!(persisted = report.persisted, "flushed event batch");
                Ok(report)
            }
            Err(e) => {
                for pending in &mut batch {
                    pending.attempts += 1;
                }
                if batch.iter().any(|p| p.attempts >= MAX_FLUSH_ATTEMPTS) {
                    warn!(error = %e, "batch failed repeatedly, writing events one by one");
                    return self.flush_one_by_one(batch);
                }
                self.requeue(batch);
                warn!(error = %e, pending = self.pending(), "flush failed, batch kept for retry");
                Err(e)
            }
        }
    }

    /// Write `batch` event by event in order. A lone failure of an exhausted
    /// event is dead-lettered; any other failure stops and requeues the rest.
    fn flush_one_by_one(&self, batch: Vec<PendingEvent>) -> Result<FlushReport, StoreError> {
        let mut report = FlushReport::default();
        let mut rest = batch.into_iter();
        while let Some(pending) = rest.next() {
            let Err(e) = self.write_batch(std::slice::from_ref(&pending)) else {
                report.persisted += 1;
                report.last_event_id = Some(pending.id.clone());
                continue;
            };
            if pending.attempts >= MAX_FLUSH_ATTEMPTS {
                let moved = self
                    .db
                    .with_tx(|tx| dead_letter(tx, &pending, &e.to_string()));
                if moved.is_ok() {
                    error!(
                        id = %pending.id,
                        event_type = pending.event.event_type(),
                        error = %e,
                        "event dead-lettered"
                    );
                    report.dead_lettered += 1;
                    continue;
                }
            }
            let mut unwritten = vec![pending];
            unwritten.extend(rest);
            self.requeue(unwritten);
            if report.persisted + report.dead_lettered == 0 {
                warn!(error = %e, pending = self.pending(), "flush failed, batch kept for retry");
                return Err(e);
            }
            break;
        }
        debug!(
            persisted = report.persisted,
            dead_lettered = report.dead_lettered,
            "flushed events one by one"
        );
        Ok(report)
    }

    /// Put `batch` back in front of anything queued meanwhile.
    fn requeue(&self, batch: Vec<PendingEvent>) {
        let mut queue = self.queue.lock();
        for pending in batch.into_iter().rev() {
            queue.push_front(pending);
        }
    }

    fn write_batch(&self, batch: &[PendingEvent]) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            for pending in batch {
                let _ = EventLog::append(tx, &pending.id, &pending.event)?;
                TaskTable::project(tx, &pending.event)?;
            }
            Ok(())
        })
    }
}

fn dead_letter(conn: &Connection, pending: &PendingEvent, reason: &str) -> Result<(), StoreError> {
    let payload = match pending.event.payload() {
        Ok(value) => value.to_string(),
        Err(e) => format!("\"unserializable: {e}\""),
    };
    let _ = conn.execute(
        "INSERT OR REPLACE INTO dead_events (id, type, target_id, payload_json, error, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            pending.id.as_str(),
            pending.event.event_type(),
            pending.event.target_id,
            payload,
            reason,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

impl EventSink for PersistenceService {
    fn queue_event(&self, event: TaskEvent) {
        let _ = self.queue(event);
    }
}
