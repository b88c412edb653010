use planline_core::{ConstraintType, TaskId};
use planline_store::StoreError;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OrderingError {
    #[error("invalid sort key {0:?}")]
    InvalidKey(String),

    #[error("sort key {before:?} is not below {after:?}")]
    OutOfOrder { before: String, after: String },
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HistoryError {
    #[error("composite action {0:?} is already open")]
    NestedComposite(String),

    #[error("no composite action is open")]
    NoComposite,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("operation queue closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("dependency cycle through {0}")]
    Cycle(String),

    #[error("scheduling failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ordering error: {0}")]
    Ordering(#[from] OrderingError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("import rejected: {0}")]
    ImportRejected(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("{finish} cannot be before {start}")]
    FinishBeforeStart {
        start: &'static str,
        finish: &'static str,
    },

    #[error("{finish} requires {start}")]
    FinishWithoutStart {
        start: &'static str,
        finish: &'static str,
    },

    #[error("constraint {0:?} requires a constraint date")]
    MissingConstraintDate(ConstraintType),

    #[error("progress must be between 0 and 100, got {0}")]
    ProgressOutOfRange(f64),

    #[error("{field} must be a non-negative number, got {value}")]
    InvalidDuration { field: &'static str, value: f64 },

    #[error("invalid sort key {0:?}")]
    InvalidSortKey(String),

    #[error("task {0} already exists")]
    DuplicateId(TaskId),

    #[error("task {0} not found")]
    UnknownTask(TaskId),

    #[error("parent {0} not found")]
    UnknownParent(TaskId),

    #[error("placing the task under {0} would create a cycle")]
    ParentCycle(TaskId),

    #[error("dependency on unknown task {0}")]
    UnknownDependency(TaskId),

    #[error("a task cannot depend on itself")]
    SelfDependency,

    #[error("dependency on blank row {0}")]
    BlankDependency(TaskId),

    #[error("{0} is not in the target group")]
    AnchorNotSibling(TaskId),
}
