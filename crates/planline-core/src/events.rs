use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::ids::TaskId;
use crate::task::{FieldChange, Task};

/// Target id used by `CALENDAR_UPDATED` events.
pub const CALENDAR_TARGET: &str = "calendar";
/// Target id used by `PROJECT_IMPORTED` events.
pub const PROJECT_TARGET: &str = "project";

/// Event payloads, discriminated by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskCreated(Box<Task>),
    TaskUpdated(FieldChange),
    TaskDeleted {},
    CalendarUpdated(Calendar),
    ProjectImported { source: String, task_count: usize },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCreated(_) => "TASK_CREATED",
            Self::TaskUpdated(_) => "TASK_UPDATED",
            Self::TaskDeleted {} => "TASK_DELETED",
            Self::CalendarUpdated(_) => "CALENDAR_UPDATED",
            Self::ProjectImported { .. } => "PROJECT_IMPORTED",
        }
    }
}

/// An immutable store event. Durable ids are assigned by persistence when
/// the event is queued, so the same event value can be re-emitted by
/// undo/redo without colliding in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(kind: EventKind, target_id: impl Into<String>) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn created(task: Task) -> Self {
        let target = task.id.to_string();
        Self::new(EventKind::TaskCreated(Box::new(task.stripped())), target)
    }

    pub fn updated(id: &TaskId, change: FieldChange) -> Self {
        Self::new(EventKind::TaskUpdated(change), id.as_str())
    }

    pub fn deleted(id: &TaskId) -> Self {
        Self::new(EventKind::TaskDeleted {}, id.as_str())
    }

    pub fn calendar_updated(calendar: Calendar) -> Self {
        Self::new(EventKind::CalendarUpdated(calendar), CALENDAR_TARGET)
    }

    pub fn project_imported(source: impl Into<String>, task_count: usize) -> Self {
        Self::new(
            EventKind::ProjectImported {
                source: source.into(),
                task_count,
            },
            PROJECT_TARGET,
        )
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn task_id(&self) -> TaskId {
        TaskId::from_raw(self.target_id.clone())
    }

    /// The `payload` half of the adjacently tagged encoding.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(&self.kind)?;
        Ok(value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({})))
    }

    /// Rebuild an event from its stored columns.
    pub fn from_parts(
        event_type: &str,
        target_id: impl Into<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let kind = serde_json::from_value(serde_json::json!({
            "type": event_type,
            "payload": payload,
        }))?;
        Ok(Self {
            kind,
            target_id: target_id.into(),
            timestamp,
        })
    }

    /// Same event with a fresh timestamp, used when history re-emits it.
    pub fn restamped(&self) -> Self {
        Self {
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// Receiver for events produced by store mutators.
pub trait EventSink: Send + Sync {
    /// Buffer an event for durable storage. Must not block.
    fn queue_event(&self, event: TaskEvent);
}
