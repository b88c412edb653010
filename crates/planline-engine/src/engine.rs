//! Boundary to the external scheduling engine.
//!
//! The engine owns date math (critical path, calendar arithmetic). The store
//! hands it the schedulable tasks and merges back only the derived
//! [`Schedule`] block.

use planline_core::{Calendar, Schedule, Task, TaskId};

use crate::error::EngineError;

#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleResult {
    pub id: TaskId,
    pub schedule: Schedule,
}

pub trait ScheduleEngine: Send + Sync {
    /// Compute schedules for `tasks`. Blank rows are never passed in.
    fn schedule(&self, tasks: &[Task], calendar: &Calendar)
        -> Result<Vec<ScheduleResult>, EngineError>;
}
