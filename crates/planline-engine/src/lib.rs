//! # planline-engine
//!
//! The in-memory side of planline: the [`TaskStore`] and its undo
//! [`HistoryManager`], fractional sort keys, the serial [`OperationQueue`],
//! input validation, the scheduling-engine seam, and the [`Planner`] context
//! that wires them to persistence.

pub mod engine;
pub mod error;
pub mod history;
pub mod ordering;
pub mod planner;
pub mod queue;
pub mod store;
pub mod validation;

pub use engine::{ScheduleEngine, ScheduleResult};
pub use error::{
    EngineError, HistoryError, OrderingError, PlannerError, QueueError, ValidationError,
};
pub use history::{HistoryAction, HistoryManager, HistoryState, SubscriptionId};
pub use planner::Planner;
pub use queue::OperationQueue;
pub use store::TaskStore;
pub use validation::{parse_date_input, OperationResult};
