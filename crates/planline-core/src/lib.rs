//! # planline-core
//!
//! Shared vocabulary for the planline workspace: ids, the [`Task`] model,
//! the [`TaskEvent`] union and the [`EventSink`] seam, plus layered settings.

pub mod calendar;
pub mod events;
pub mod ids;
pub mod settings;
pub mod task;

pub use calendar::Calendar;
pub use events::{EventKind, EventSink, TaskEvent};
pub use ids::{EventId, TaskId};
pub use settings::{PlanlineSettings, SettingsError};
pub use task::{
    ConstraintType, Dependency, DependencyType, FieldChange, RowType, Schedule, SchedulingMode,
    Task, TaskPatch,
};
