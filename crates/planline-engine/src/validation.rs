//! Checks run by the planner before a mutation reaches the store.
//!
//! The store itself trusts its input. Everything here is read-only, so a
//! failed check leaves state untouched and surfaces as an
//! [`OperationResult`] with `success: false`.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use chrono::NaiveDate;
use planline_core::{Task, TaskId, TaskPatch};
use regex::Regex;
use serde::Serialize;

use crate::error::ValidationError;
use crate::ordering;
use crate::store::TaskStore;

static DATE_INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// Outcome of a validated service call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, id: TaskId) -> Self {
        self.task_id = Some(id);
        self
    }
}

impl From<ValidationError> for OperationResult {
    fn from(err: ValidationError) -> Self {
        Self::failure(err.to_string())
    }
}

/// Parse user-entered `YYYY-MM-DD`.
pub fn parse_date_input(input: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = input.trim();
    if !DATE_INPUT.is_match(trimmed) {
        return Err(ValidationError::InvalidDate(input.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(input.to_string()))
}

/// Field-level rules that need no other task.
pub fn validate_fields(task: &Task) -> Result<(), ValidationError> {
    check_date_pair(task.actual_start, task.actual_finish, "actual_start", "actual_finish")?;
    check_date_pair(
        task.baseline_start,
        task.baseline_finish,
        "baseline_start",
        "baseline_finish",
    )?;
    if task.constraint_type.requires_date() && task.constraint_date.is_none() {
        return Err(ValidationError::MissingConstraintDate(task.constraint_type));
    }
    if !(0.0..=100.0).contains(&task.progress) {
        return Err(ValidationError::ProgressOutOfRange(task.progress));
    }
    check_duration("duration", Some(task.duration))?;
    check_duration("remaining_duration", task.remaining_duration)?;
    check_duration("baseline_duration", task.baseline_duration)?;
    Ok(())
}

fn check_date_pair(
    start: Option<NaiveDate>,
    finish: Option<NaiveDate>,
    start_name: &'static str,
    finish_name: &'static str,
) -> Result<(), ValidationError> {
    match (start, finish) {
        (None, Some(_)) => Err(ValidationError::FinishWithoutStart {
            start: start_name,
            finish: finish_name,
        }),
        (Some(start), Some(finish)) if finish < start => Err(ValidationError::FinishBeforeStart {
            start: start_name,
            finish: finish_name,
        }),
        _ => Ok(()),
    }
}

fn check_duration(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(value) if !value.is_finite() || value < 0.0 => {
            Err(ValidationError::InvalidDuration { field, value })
        }
        _ => Ok(()),
    }
}

/// `lookup` answers "does this task exist, and is it blank?".
fn check_dependencies(
    task: &Task,
    lookup: impl Fn(&TaskId) -> Option<bool>,
) -> Result<(), ValidationError> {
    for dep in &task.dependencies {
        if dep.id == task.id {
            return Err(ValidationError::SelfDependency);
        }
        match lookup(&dep.id) {
            None => return Err(ValidationError::UnknownDependency(dep.id.clone())),
            Some(true) => return Err(ValidationError::BlankDependency(dep.id.clone())),
            Some(false) => {}
        }
    }
    Ok(())
}

/// An explicit key must be well formed. Empty means "append".
fn check_sort_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() || ordering::is_valid_key(key) {
        Ok(())
    } else {
        Err(ValidationError::InvalidSortKey(key.to_string()))
    }
}

fn store_lookup(store: &TaskStore) -> impl Fn(&TaskId) -> Option<bool> + '_ {
    |id| store.get(id).map(Task::is_blank)
}

fn check_parent(
    store: &TaskStore,
    id: &TaskId,
    parent: Option<&TaskId>,
) -> Result<(), ValidationError> {
    let Some(parent) = parent else {
        return Ok(());
    };
    if !store.contains(parent) {
        return Err(ValidationError::UnknownParent(parent.clone()));
    }
    if store.would_create_cycle(id, Some(parent)) {
        return Err(ValidationError::ParentCycle(parent.clone()));
    }
    Ok(())
}

/// `after` must sit in the group under `parent`.
pub fn validate_anchor(
    store: &TaskStore,
    parent: Option<&TaskId>,
    after: Option<&TaskId>,
) -> Result<(), ValidationError> {
    let Some(after) = after else {
        return Ok(());
    };
    match store.get(after) {
        Some(anchor) if anchor.parent_id.as_ref() == parent => Ok(()),
        _ => Err(ValidationError::AnchorNotSibling(after.clone())),
    }
}

pub fn validate_new_task(store: &TaskStore, task: &Task) -> Result<(), ValidationError> {
    if store.contains(&task.id) {
        return Err(ValidationError::DuplicateId(task.id.clone()));
    }
    validate_fields(task)?;
    check_sort_key(&task.sort_key)?;
    check_parent(store, &task.id, task.parent_id.as_ref())?;
    check_dependencies(task, store_lookup(store))
}

/// Validate the task as it would look after `patch`.
pub fn validate_patch(
    store: &TaskStore,
    id: &TaskId,
    patch: &TaskPatch,
) -> Result<(), ValidationError> {
    let current = store
        .get(id)
        .ok_or_else(|| ValidationError::UnknownTask(id.clone()))?;
    let mut candidate = current.clone();
    for change in current.diff(patch) {
        candidate.apply_change(&change);
    }
    validate_fields(&candidate)?;
    if let Some(key) = &patch.sort_key {
        check_sort_key(key)?;
    }
    if patch.parent_id.is_some() && candidate.parent_id != current.parent_id {
        check_parent(store, id, candidate.parent_id.as_ref())?;
    }
    if patch.dependencies.is_some() {
        check_dependencies(&candidate, store_lookup(store))?;
    }
    Ok(())
}

pub fn validate_move(
    store: &TaskStore,
    id: &TaskId,
    new_parent: Option<&TaskId>,
    after: Option<&TaskId>,
) -> Result<(), ValidationError> {
    if !store.contains(id) {
        return Err(ValidationError::UnknownTask(id.clone()));
    }
    check_parent(store, id, new_parent)?;
    if after == Some(id) {
        return Err(ValidationError::AnchorNotSibling(id.clone()));
    }
    validate_anchor(store, new_parent, after)
}

/// Whole-batch check for an import. Parents and dependencies may point at
/// tasks in the store or elsewhere in the batch.
pub fn validate_import(store: &TaskStore, tasks: &[Task]) -> Result<(), ValidationError> {
    let batch: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(&task.id) || store.contains(&task.id) {
            return Err(ValidationError::DuplicateId(task.id.clone()));
        }
        validate_fields(task)?;
        check_sort_key(&task.sort_key)?;
        if let Some(parent) = &task.parent_id {
            if !batch.contains_key(parent) && !store.contains(parent) {
                return Err(ValidationError::UnknownParent(parent.clone()));
            }
        }
        check_dependencies(task, |id| {
            batch
                .get(id)
                .map(|t| t.is_blank())
                .or_else(|| store.get(id).map(Task::is_blank))
        })?;
    }

    // Parent chains inside the batch must terminate.
    for task in tasks {
        let mut cursor = task.parent_id.as_ref();
        let mut steps = 0;
        while let Some(parent) = cursor {
            if parent == &task.id || steps > tasks.len() {
                return Err(ValidationError::ParentCycle(parent.clone()));
            }
            steps += 1;
            cursor = batch.get(parent).and_then(|t| t.parent_id.as_ref());
        }
    }
    Ok(())
}
