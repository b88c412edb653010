//! Task model.
//!
//! A [`Task`] carries two kinds of state. The authoritative input fields are
//! persisted, evented and undoable. The derived fields (`display_order` and
//! the [`Schedule`] block) are recomputed in memory and skipped by serde, so
//! anything that serializes a task strips them for free.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Default duration, in working days, of a freshly created task.
pub const DEFAULT_DURATION: f64 = 1.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowType {
    #[default]
    Task,
    /// Placeholder row with no schedule semantics.
    Blank,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConstraintType {
    /// As soon as possible.
    #[default]
    Asap,
    /// As late as possible.
    Alap,
    /// Start no earlier than.
    Snet,
    /// Start no later than.
    Snlt,
    /// Finish no earlier than.
    Fnet,
    /// Finish no later than.
    Fnlt,
    /// Must start on.
    Mso,
    /// Must finish on.
    Mfo,
}

impl ConstraintType {
    /// Whether this constraint is meaningless without a `constraint_date`.
    pub fn requires_date(self) -> bool {
        !matches!(self, Self::Asap | Self::Alap)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyType {
    #[default]
    FS,
    SS,
    FF,
    SF,
}

/// A predecessor link. `id` names the predecessor task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: TaskId,
    #[serde(rename = "type", default)]
    pub kind: DependencyType,
    #[serde(default)]
    pub lag: i32,
}

impl Dependency {
    pub fn finish_to_start(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            kind: DependencyType::FS,
            lag: 0,
        }
    }
}

/// Fields owned by the external scheduling engine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schedule {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub level: u32,
    pub is_critical: bool,
    pub total_float: Option<f64>,
    pub free_float: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: TaskId,
    pub parent_id: Option<TaskId>,
    pub sort_key: String,
    pub row_type: RowType,
    pub name: String,
    pub notes: String,
    pub duration: f64,
    pub constraint_type: ConstraintType,
    pub constraint_date: Option<NaiveDate>,
    pub scheduling_mode: SchedulingMode,
    pub dependencies: Vec<Dependency>,
    pub progress: f64,
    pub actual_start: Option<NaiveDate>,
    pub actual_finish: Option<NaiveDate>,
    pub remaining_duration: Option<f64>,
    pub baseline_start: Option<NaiveDate>,
    pub baseline_finish: Option<NaiveDate>,
    pub baseline_duration: Option<f64>,
    pub is_collapsed: bool,

    /// 1-based position within the sibling group. Derived from sort order.
    #[serde(skip)]
    pub display_order: u32,
    #[serde(skip)]
    pub schedule: Schedule,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: TaskId::new(),
            parent_id: None,
            sort_key: String::new(),
            row_type: RowType::Task,
            name: String::new(),
            notes: String::new(),
            duration: DEFAULT_DURATION,
            constraint_type: ConstraintType::Asap,
            constraint_date: None,
            scheduling_mode: SchedulingMode::Auto,
            dependencies: Vec::new(),
            progress: 0.0,
            actual_start: None,
            actual_finish: None,
            remaining_duration: None,
            baseline_start: None,
            baseline_finish: None,
            baseline_duration: None,
            is_collapsed: false,
            display_order: 0,
            schedule: Schedule::default(),
        }
    }
}

impl Task {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// A placeholder row at the given position.
    pub fn blank(id: TaskId, parent_id: Option<TaskId>, sort_key: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            sort_key: sort_key.into(),
            row_type: RowType::Blank,
            duration: 0.0,
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_sort_key(mut self, key: impl Into<String>) -> Self {
        self.sort_key = key.into();
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.row_type == RowType::Blank
    }

    pub fn depends_on(&self, id: &TaskId) -> bool {
        self.dependencies.iter().any(|d| &d.id == id)
    }

    /// Copy with the derived fields reset, i.e. what persistence sees.
    pub fn stripped(&self) -> Self {
        Self {
            display_order: 0,
            schedule: Schedule::default(),
            ..self.clone()
        }
    }
}

macro_rules! task_fields {
    ($( $variant:ident => $field:ident : $ty:ty ),* $(,)?) => {
        /// Partial update. `None` leaves a field untouched.
        #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct TaskPatch {
            $(
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        /// A single-field change, the payload of `TASK_UPDATED`.
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "field", rename_all = "snake_case")]
        pub enum FieldChange {
            $( $variant { old_value: $ty, new_value: $ty }, )*
        }

        impl FieldChange {
            pub fn field_name(&self) -> &'static str {
                match self {
                    $( Self::$variant { .. } => stringify!($field), )*
                }
            }

            /// The change that undoes this one.
            pub fn inverted(&self) -> Self {
                match self {
                    $(
                        Self::$variant { old_value, new_value } => Self::$variant {
                            old_value: new_value.clone(),
                            new_value: old_value.clone(),
                        },
                    )*
                }
            }
        }

        impl TaskPatch {
            pub fn is_empty(&self) -> bool {
                true $( && self.$field.is_none() )*
            }
        }

        impl Task {
            /// One change per field whose patched value differs, in declaration order.
            pub fn diff(&self, patch: &TaskPatch) -> Vec<FieldChange> {
                let mut changes = Vec::new();
                $(
                    if let Some(value) = &patch.$field {
                        if *value != self.$field {
                            changes.push(FieldChange::$variant {
                                old_value: self.$field.clone(),
                                new_value: value.clone(),
                            });
                        }
                    }
                )*
                changes
            }

            /// Changes that turn `self` into `target`, ignoring `id` and derived fields.
            pub fn changes_to(&self, target: &Task) -> Vec<FieldChange> {
                let mut changes = Vec::new();
                $(
                    if self.$field != target.$field {
                        changes.push(FieldChange::$variant {
                            old_value: self.$field.clone(),
                            new_value: target.$field.clone(),
                        });
                    }
                )*
                changes
            }

            pub fn apply_change(&mut self, change: &FieldChange) {
                match change {
                    $( FieldChange::$variant { new_value, .. } => self.$field = new_value.clone(), )*
                }
            }
        }
    };
}

task_fields! {
    ParentId => parent_id: Option<TaskId>,
    SortKey => sort_key: String,
    RowType => row_type: RowType,
    Name => name: String,
    Notes => notes: String,
    Duration => duration: f64,
    ConstraintType => constraint_type: ConstraintType,
    ConstraintDate => constraint_date: Option<NaiveDate>,
    SchedulingMode => scheduling_mode: SchedulingMode,
    Dependencies => dependencies: Vec<Dependency>,
    Progress => progress: f64,
    ActualStart => actual_start: Option<NaiveDate>,
    ActualFinish => actual_finish: Option<NaiveDate>,
    RemainingDuration => remaining_duration: Option<f64>,
    BaselineStart => baseline_start: Option<NaiveDate>,
    BaselineFinish => baseline_finish: Option<NaiveDate>,
    BaselineDuration => baseline_duration: Option<f64>,
    IsCollapsed => is_collapsed: bool,
}

impl FieldChange {
    /// Whether applying this change can move the task to another sibling slot.
    pub fn affects_position(&self) -> bool {
        matches!(self, Self::ParentId { .. } | Self::SortKey { .. })
    }
}
