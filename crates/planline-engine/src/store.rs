//! The authoritative in-memory task graph.
//!
//! Tasks live in one `Vec` (the physical array) with an id index. Within a
//! sibling group physical order is visual order and always follows
//! `sort_key`; `display_order` is rewritten from it after every mutation.
//!
//! Every mutator builds a [`Transaction`] of forward/backward event pairs,
//! applying each forward event as it goes. Committing records the pairs as a
//! single history action and hands the forward events to the [`EventSink`].
//! Replay paths ([`TaskStore::apply_event`], undo, redo) go through the same
//! event application without touching history.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use planline_core::task::DEFAULT_DURATION;
use planline_core::{
    Calendar, Dependency, EventKind, EventSink, FieldChange, RowType, Task, TaskEvent, TaskId,
    TaskPatch,
};
use tracing::{debug, info, instrument, warn};

use crate::engine::ScheduleResult;
use crate::error::{HistoryError, OrderingError};
use crate::history::HistoryManager;
use crate::ordering;

/// Forward/backward pairs collected by one mutation.
#[derive(Default)]
struct Transaction {
    forward: Vec<TaskEvent>,
    backward: Vec<TaskEvent>,
    groups: Vec<Option<TaskId>>,
}

#[derive(Clone, Copy)]
enum Placement {
    /// After siblings with an equal key. Used for creation.
    AfterEqual,
    /// Before siblings with an equal key. Used when a task changes parent.
    BeforeEqual,
}

pub struct TaskStore {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    calendar: Calendar,
    history: HistoryManager,
    sink: Option<Arc<dyn EventSink>>,
}

impl TaskStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            tasks: Vec::new(),
            index: HashMap::new(),
            calendar: Calendar::default(),
            history: HistoryManager::new(max_history),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn set_sink(&mut self, sink: Option<Arc<dyn EventSink>>) {
        self.sink = sink;
    }

    /// Replace all state with loaded data. No events, no history.
    pub fn hydrate(&mut self, mut tasks: Vec<Task>, calendar: Calendar) {
        // Stable: ties keep load order.
        tasks.sort_by(|a, b| {
            a.parent_id
                .cmp(&b.parent_id)
                .then_with(|| a.sort_key.cmp(&b.sort_key))
        });
        let mut counters: HashMap<Option<TaskId>, u32> = HashMap::new();
        for task in &mut tasks {
            let n = counters.entry(task.parent_id.clone()).or_insert(0);
            *n += 1;
            task.display_order = *n;
        }
        self.tasks = tasks;
        self.index.clear();
        self.reindex_from(0);
        self.calendar = calendar;
        self.history.clear();
        info!(tasks = self.tasks.len(), "task store hydrated");
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.position(id).map(|pos| &self.tasks[pos])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// All tasks in physical order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sibling group under `parent`, in visual order.
    pub fn children(&self, parent: Option<&TaskId>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.parent_id.as_ref() == parent)
            .collect()
    }

    /// Non-blank tasks, the input of the scheduling engine.
    pub fn get_schedulable_tasks(&self) -> Vec<Task> {
        self.tasks.iter().filter(|t| !t.is_blank()).cloned().collect()
    }

    pub fn calendar(&self) -> &Calendar {
        &self.calendar
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryManager {
        &mut self.history
    }

    /// `id` and all of its descendants, pre-order.
    pub fn subtree(&self, id: &TaskId) -> Vec<TaskId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id.clone()];
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let children: Vec<TaskId> = self.child_ids(Some(&next));
            stack.extend(children.into_iter().rev());
            out.push(next);
        }
        out
    }

    /// Whether making `new_parent` the parent of `id` would close a loop.
    pub fn would_create_cycle(&self, id: &TaskId, new_parent: Option<&TaskId>) -> bool {
        let mut cursor = new_parent.cloned();
        let mut steps = 0;
        while let Some(current) = cursor {
            if &current == id {
                return true;
            }
            steps += 1;
            if steps > self.tasks.len() {
                // Pre-existing loop in loaded data.
                return true;
            }
            cursor = self.get(&current).and_then(|t| t.parent_id.clone());
        }
        false
    }

    // ── Mutators ─────────────────────────────────────────────────────────

    /// Insert a task. An empty `sort_key` appends it to its sibling group.
    #[instrument(skip_all, fields(id = %task.id))]
    pub fn add(&mut self, mut task: Task) -> Result<TaskId, OrderingError> {
        let mut tx = Transaction::default();
        if task.sort_key.is_empty() {
            self.normalize(&mut tx, task.parent_id.as_ref());
            task.sort_key = match self.append_key(task.parent_id.as_ref()) {
                Ok(key) => key,
                Err(e) => return Err(self.abort(tx, e)),
            };
        }
        let id = task.id.clone();
        let label = if task.is_blank() { "Add row" } else { "Add task" };
        self.step(&mut tx, TaskEvent::created(task), Some(TaskEvent::deleted(&id)));
        self.commit(tx, label);
        Ok(id)
    }

    /// Insert a task directly below `after` in its parent's group, or at the
    /// top of the group when `after` is `None`.
    pub fn insert_after(
        &mut self,
        mut task: Task,
        after: Option<&TaskId>,
    ) -> Result<TaskId, OrderingError> {
        let mut tx = Transaction::default();
        self.normalize(&mut tx, task.parent_id.as_ref());
        task.sort_key = match self.key_after(task.parent_id.as_ref(), after, None) {
            Ok(key) => key,
            Err(e) => return Err(self.abort(tx, e)),
        };
        let id = task.id.clone();
        self.step(&mut tx, TaskEvent::created(task), Some(TaskEvent::deleted(&id)));
        self.commit(tx, "Add task");
        Ok(id)
    }

    /// Apply a partial update, one event per changed field. Returns the
    /// number of fields changed.
    ///
    /// Moving to another parent without an explicit `sort_key` appends the
    /// task to the new group.
    pub fn update(&mut self, id: &TaskId, patch: &TaskPatch) -> Result<usize, OrderingError> {
        let Some(current) = self.get(id) else {
            debug!(%id, "update of unknown task ignored");
            return Ok(0);
        };
        let mut patch = patch.clone();
        let reparenting = patch
            .parent_id
            .as_ref()
            .is_some_and(|parent| *parent != current.parent_id);

        let mut tx = Transaction::default();
        if reparenting && patch.sort_key.is_none() {
            let new_parent = patch.parent_id.clone().flatten();
            self.normalize(&mut tx, new_parent.as_ref());
            patch.sort_key = match self.append_key(new_parent.as_ref()) {
                Ok(key) => Some(key),
                Err(e) => return Err(self.abort(tx, e)),
            };
        }

        let changes = self.get(id).map(|t| t.diff(&patch)).unwrap_or_default();
        let count = changes.len();
        let label = match changes.as_slice() {
            [single] => format!("Edit {}", single.field_name().replace('_', " ")),
            _ => "Edit task".to_string(),
        };
        // A blank row cannot be a predecessor.
        let blanking = changes.iter().any(|c| {
            matches!(
                c,
                FieldChange::RowType {
                    new_value: RowType::Blank,
                    ..
                }
            )
        });
        if blanking {
            let targets: HashSet<&TaskId> = HashSet::from([id]);
            for (survivor, change) in self.ghost_link_changes(&targets) {
                self.change(&mut tx, &survivor, change);
            }
        }
        for change in changes {
            self.change(&mut tx, id, change);
        }
        self.commit(tx, label);
        Ok(count)
    }

    /// Re-parent and/or reorder a task so it sits directly below `after`
    /// (top of the group when `None`) under `new_parent`.
    pub fn move_task(
        &mut self,
        id: &TaskId,
        new_parent: Option<TaskId>,
        after: Option<&TaskId>,
    ) -> Result<bool, OrderingError> {
        if !self.contains(id) {
            return Ok(false);
        }
        let mut tx = Transaction::default();
        self.normalize(&mut tx, new_parent.as_ref());
        let key = match self.key_after(new_parent.as_ref(), after, Some(id)) {
            Ok(key) => key,
            Err(e) => return Err(self.abort(tx, e)),
        };
        let patch = TaskPatch {
            parent_id: Some(new_parent),
            sort_key: Some(key),
            ..TaskPatch::default()
        };
        let changes = self.get(id).map(|t| t.diff(&patch)).unwrap_or_default();
        for change in changes {
            self.change(&mut tx, id, change);
        }
        Ok(self.commit(tx, "Move task"))
    }

    /// Delete a task as one undoable step. Returns how many tasks were
    /// removed.
    ///
    /// With `cascade` the whole subtree goes; otherwise children move up to
    /// the deleted task's parent, into its slot. Dependencies on any removed
    /// task are stripped from the survivors first.
    #[instrument(skip(self))]
    pub fn delete(&mut self, id: &TaskId, cascade: bool) -> Result<usize, OrderingError> {
        let Some(target) = self.get(id) else {
            debug!("delete of unknown task ignored");
            return Ok(0);
        };
        let parent = target.parent_id.clone();
        let doomed = if cascade {
            self.subtree(id)
        } else {
            vec![id.clone()]
        };

        let mut tx = Transaction::default();
        let doomed_set: HashSet<&TaskId> = doomed.iter().collect();
        for (survivor, change) in self.ghost_link_changes(&doomed_set) {
            self.change(&mut tx, &survivor, change);
        }

        if !cascade {
            let children = self.child_ids(Some(id));
            if !children.is_empty() {
                self.normalize(&mut tx, parent.as_ref());
                let (before, after) = self.neighbour_keys(parent.as_ref(), id);
                let keys = match ordering::generate_n_keys(
                    before.as_deref(),
                    after.as_deref(),
                    children.len(),
                ) {
                    Ok(keys) => keys,
                    Err(e) => return Err(self.abort(tx, e)),
                };
                for (child, key) in children.iter().zip(keys) {
                    let patch = TaskPatch {
                        parent_id: Some(parent.clone()),
                        sort_key: Some(key),
                        ..TaskPatch::default()
                    };
                    let changes = self.get(child).map(|t| t.diff(&patch)).unwrap_or_default();
                    for change in changes {
                        self.change(&mut tx, child, change);
                    }
                }
            }
        }

        // Leaf-first, so replaying the inverses in reverse recreates parents
        // before children.
        for doomed_id in doomed.iter().rev() {
            let Some(snapshot) = self.get(doomed_id).cloned() else {
                continue;
            };
            self.step(
                &mut tx,
                TaskEvent::deleted(doomed_id),
                Some(TaskEvent::created(snapshot)),
            );
        }

        let label = match doomed.len() {
            1 => "Delete task".to_string(),
            n => format!("Delete {n} tasks"),
        };
        self.commit(tx, label);
        info!(removed = doomed.len(), cascade, "tasks deleted");
        Ok(doomed.len())
    }

    /// Insert a placeholder row. `None` appends it to the group.
    pub fn create_blank_row(
        &mut self,
        sort_key: Option<String>,
        parent_id: Option<TaskId>,
    ) -> Result<TaskId, OrderingError> {
        self.add(Task::blank(
            TaskId::new(),
            parent_id,
            sort_key.unwrap_or_default(),
        ))
    }

    /// Turn a blank row into a real task in place, optionally naming it.
    /// `None` for unknown ids and rows that are not blank.
    pub fn wake_up_blank_row(&mut self, id: &TaskId, name: Option<String>) -> Option<Task> {
        let row = self.get(id)?;
        if !row.is_blank() {
            return None;
        }
        let patch = TaskPatch {
            row_type: Some(RowType::Task),
            name,
            duration: Some(DEFAULT_DURATION),
            ..TaskPatch::default()
        };
        let changes = row.diff(&patch);
        let mut tx = Transaction::default();
        for change in changes {
            self.change(&mut tx, id, change);
        }
        self.commit(tx, "Add task");
        self.get(id).cloned()
    }

    /// Turn a task back into a blank row in place, dropping its inputs and
    /// every dependency that points at it.
    pub fn revert_to_blank_row(&mut self, id: &TaskId) -> bool {
        let Some(task) = self.get(id) else {
            return false;
        };
        if task.is_blank() {
            return false;
        }
        let blank = Task::blank(task.id.clone(), task.parent_id.clone(), task.sort_key.clone());
        let changes = task.changes_to(&blank);

        let mut tx = Transaction::default();
        let targets: HashSet<&TaskId> = HashSet::from([id]);
        for (survivor, change) in self.ghost_link_changes(&targets) {
            self.change(&mut tx, &survivor, change);
        }
        for change in changes {
            self.change(&mut tx, id, change);
        }
        self.commit(tx, "Clear row")
    }

    pub fn set_calendar(&mut self, calendar: Calendar) -> bool {
        if calendar == self.calendar {
            return false;
        }
        let previous = self.calendar.clone();
        let mut tx = Transaction::default();
        self.step(
            &mut tx,
            TaskEvent::calendar_updated(calendar),
            Some(TaskEvent::calendar_updated(previous)),
        );
        self.commit(tx, "Change calendar")
    }

    /// Emit an audit event with no inverse, e.g. `PROJECT_IMPORTED`. Markers
    /// go to the sink only and never into history, so undo and redo do not
    /// replay them.
    pub fn record_marker(&mut self, event: TaskEvent) {
        let _ = self.apply_inner(&event);
        debug!(event_type = event.event_type(), "marker recorded");
        if let Some(sink) = &self.sink {
            sink.queue_event(event);
        }
    }

    /// Write engine output into the derived schedule block. Never evented.
    pub fn merge_schedule(&mut self, results: Vec<ScheduleResult>) -> usize {
        let mut merged = 0;
        for result in results {
            match self.position(&result.id) {
                Some(pos) => {
                    self.tasks[pos].schedule = result.schedule;
                    merged += 1;
                }
                None => debug!(id = %result.id, "schedule for unknown task dropped"),
            }
        }
        merged
    }

    // ── Replay & history ─────────────────────────────────────────────────

    /// Apply an event without recording history. Idempotent.
    pub fn apply_event(&mut self, event: &TaskEvent) {
        let groups = self.apply_inner(event);
        self.refresh_groups(groups);
    }

    pub fn apply_events(&mut self, events: &[TaskEvent]) {
        let mut groups = Vec::new();
        for event in events {
            groups.extend(self.apply_inner(event));
        }
        self.refresh_groups(groups);
    }

    /// Revert the newest action. Returns the events applied.
    pub fn undo(&mut self) -> Option<Vec<TaskEvent>> {
        let events = self.history.undo()?;
        self.apply_events(&events);
        self.emit_restamped(&events);
        Some(events)
    }

    /// Reapply the newest undone action. Returns the events applied.
    pub fn redo(&mut self) -> Option<Vec<TaskEvent>> {
        let events = self.history.redo()?;
        self.apply_events(&events);
        self.emit_restamped(&events);
        Some(events)
    }

    pub fn begin_composite(&mut self, label: impl Into<String>) -> Result<(), HistoryError> {
        self.history.begin_composite(label)
    }

    pub fn end_composite(&mut self) -> Result<bool, HistoryError> {
        self.history.end_composite()
    }

    /// Drop the open composite and revert everything recorded in it.
    pub fn cancel_composite(&mut self) -> Result<usize, HistoryError> {
        let revert = self.history.cancel_composite()?;
        self.apply_events(&revert);
        self.emit_restamped(&revert);
        Ok(revert.len())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn position(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn child_ids(&self, parent: Option<&TaskId>) -> Vec<TaskId> {
        self.children(parent).into_iter().map(|t| t.id.clone()).collect()
    }

    fn sibling_positions(&self, parent: Option<&TaskId>) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.parent_id.as_ref() == parent)
            .map(|(i, _)| i)
            .collect()
    }

    fn reindex_from(&mut self, start: usize) {
        for (pos, task) in self.tasks.iter().enumerate().skip(start) {
            let _ = self.index.insert(task.id.clone(), pos);
        }
    }

    fn remove_at(&mut self, pos: usize) -> Task {
        let task = self.tasks.remove(pos);
        let _ = self.index.remove(&task.id);
        self.reindex_from(pos);
        task
    }

    /// Stable-sort a sibling group by key within the slots it already
    /// occupies. Equal keys keep their physical order.
    fn settle_group(&mut self, parent: Option<&TaskId>) {
        let positions = self.sibling_positions(parent);
        let sorted = positions
            .windows(2)
            .all(|w| self.tasks[w[0]].sort_key <= self.tasks[w[1]].sort_key);
        let Some(&start) = positions.first() else {
            return;
        };
        if sorted {
            return;
        }
        let mut group: Vec<Task> = positions.iter().map(|&pos| self.tasks[pos].clone()).collect();
        group.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        for (pos, task) in positions.into_iter().zip(group) {
            self.tasks[pos] = task;
        }
        self.reindex_from(start);
    }

    fn insert_placed(&mut self, task: Task, placement: Placement) {
        let siblings = self.sibling_positions(task.parent_id.as_ref());
        let key = task.sort_key.as_str();
        let next = siblings.iter().copied().find(|&pos| {
            let other = self.tasks[pos].sort_key.as_str();
            match placement {
                Placement::AfterEqual => other > key,
                Placement::BeforeEqual => other >= key,
            }
        });
        let pos = match (next, siblings.last()) {
            (Some(pos), _) => pos,
            (None, Some(&last)) => last + 1,
            (None, None) => self.tasks.len(),
        };
        self.tasks.insert(pos, task);
        self.reindex_from(pos);
    }

    /// Apply one event to the physical array. Returns the sibling groups it
    /// touched.
    fn apply_inner(&mut self, event: &TaskEvent) -> Vec<Option<TaskId>> {
        match &event.kind {
            EventKind::TaskCreated(task) => {
                let mut touched = vec![task.parent_id.clone()];
                if let Some(pos) = self.position(&task.id) {
                    let existing = &self.tasks[pos];
                    if existing.parent_id == task.parent_id && existing.sort_key == task.sort_key {
                        let replacement = Task {
                            display_order: existing.display_order,
                            schedule: existing.schedule.clone(),
                            ..(**task).clone()
                        };
                        self.tasks[pos] = replacement;
                        return touched;
                    }
                    touched.push(self.remove_at(pos).parent_id);
                }
                self.insert_placed((**task).clone(), Placement::AfterEqual);
                touched
            }
            EventKind::TaskUpdated(change) => {
                let id = event.task_id();
                let Some(pos) = self.position(&id) else {
                    debug!(%id, field = change.field_name(), "update for unknown task skipped");
                    return Vec::new();
                };
                if !change.affects_position() {
                    self.tasks[pos].apply_change(change);
                    return Vec::new();
                }
                if let FieldChange::SortKey { .. } = change {
                    // Settled by key once the whole batch is applied.
                    self.tasks[pos].apply_change(change);
                    return vec![self.tasks[pos].parent_id.clone()];
                }
                let mut task = self.remove_at(pos);
                let old_parent = task.parent_id.clone();
                task.apply_change(change);
                let new_parent = task.parent_id.clone();
                self.insert_placed(task, Placement::BeforeEqual);
                vec![old_parent, new_parent]
            }
            EventKind::TaskDeleted {} => match self.position(&event.task_id()) {
                Some(pos) => vec![self.remove_at(pos).parent_id],
                None => Vec::new(),
            },
            EventKind::CalendarUpdated(calendar) => {
                self.calendar = calendar.clone();
                Vec::new()
            }
            EventKind::ProjectImported { .. } => Vec::new(),
        }
    }

    fn refresh_groups(&mut self, groups: Vec<Option<TaskId>>) {
        let unique: HashSet<Option<TaskId>> = groups.into_iter().collect();
        for group in unique {
            self.settle_group(group.as_ref());
            self.refresh_display_order(group.as_ref());
        }
    }

    fn refresh_display_order(&mut self, parent: Option<&TaskId>) {
        for (order, pos) in (1..).zip(self.sibling_positions(parent)) {
            self.tasks[pos].display_order = order;
        }
    }

    fn step(&mut self, tx: &mut Transaction, forward: TaskEvent, backward: Option<TaskEvent>) {
        tx.groups.extend(self.apply_inner(&forward));
        tx.forward.push(forward);
        tx.backward.extend(backward);
    }

    fn change(&mut self, tx: &mut Transaction, id: &TaskId, change: FieldChange) {
        let inverse = TaskEvent::updated(id, change.inverted());
        self.step(tx, TaskEvent::updated(id, change), Some(inverse));
    }

    /// Repair broken keys in a sibling group (evented, inside `tx`) and
    /// rewrite its display order.
    fn normalize(&mut self, tx: &mut Transaction, parent: Option<&TaskId>) {
        self.settle_group(parent);
        let positions = self.sibling_positions(parent);
        let siblings: Vec<&Task> = positions.iter().map(|&pos| &self.tasks[pos]).collect();
        if let Some(keys) = ordering::normalize_group(&siblings).sort_keys {
            let repairs: Vec<(TaskId, FieldChange)> = positions
                .iter()
                .zip(keys)
                .filter_map(|(&pos, key)| {
                    let task = &self.tasks[pos];
                    (task.sort_key != key).then(|| {
                        (
                            task.id.clone(),
                            FieldChange::SortKey {
                                old_value: task.sort_key.clone(),
                                new_value: key,
                            },
                        )
                    })
                })
                .collect();
            warn!(
                parent = ?parent.map(TaskId::as_str),
                repaired = repairs.len(),
                "repairing broken sort keys"
            );
            for (id, change) in repairs {
                self.change(tx, &id, change);
            }
        }
        self.refresh_display_order(parent);
    }

    fn commit(&mut self, mut tx: Transaction, label: impl Into<String>) -> bool {
        let groups: HashSet<Option<TaskId>> = std::mem::take(&mut tx.groups).into_iter().collect();
        for group in &groups {
            self.normalize(&mut tx, group.as_ref());
        }
        if tx.forward.is_empty() {
            return false;
        }
        if let Some(sink) = &self.sink {
            for event in &tx.forward {
                sink.queue_event(event.clone());
            }
        }
        self.history.record_action(tx.forward, tx.backward, label);
        true
    }

    /// Undo whatever `tx` already applied. Nothing was emitted or recorded.
    fn abort(&mut self, tx: Transaction, err: OrderingError) -> OrderingError {
        warn!(error = %err, applied = tx.forward.len(), "mutation aborted");
        let revert: Vec<TaskEvent> = tx.backward.into_iter().rev().collect();
        self.apply_events(&revert);
        err
    }

    fn emit_restamped(&self, events: &[TaskEvent]) {
        if let Some(sink) = &self.sink {
            for event in events {
                sink.queue_event(event.restamped());
            }
        }
    }

    fn append_key(&self, parent: Option<&TaskId>) -> Result<String, OrderingError> {
        let last = self.children(parent).last().map(|t| t.sort_key.clone());
        ordering::generate_insert_key(last.as_deref(), None)
    }

    /// Key for a slot directly below `after` in the group, skipping `moving`.
    fn key_after(
        &self,
        parent: Option<&TaskId>,
        after: Option<&TaskId>,
        moving: Option<&TaskId>,
    ) -> Result<String, OrderingError> {
        let siblings: Vec<&Task> = self
            .children(parent)
            .into_iter()
            .filter(|t| Some(&t.id) != moving)
            .collect();
        let slot = match after {
            None => 0,
            Some(after) => match siblings.iter().position(|t| &t.id == after) {
                Some(i) => i + 1,
                None => {
                    debug!(%after, "anchor not in group, appending");
                    siblings.len()
                }
            },
        };
        let before = slot.checked_sub(1).map(|i| siblings[i].sort_key.as_str());
        let next = siblings.get(slot).map(|t| t.sort_key.as_str());
        ordering::generate_insert_key(before, next)
    }

    /// Keys of the siblings directly above and below `id`.
    fn neighbour_keys(
        &self,
        parent: Option<&TaskId>,
        id: &TaskId,
    ) -> (Option<String>, Option<String>) {
        let siblings = self.children(parent);
        let Some(i) = siblings.iter().position(|t| &t.id == id) else {
            return (siblings.last().map(|t| t.sort_key.clone()), None);
        };
        let before = i.checked_sub(1).map(|j| siblings[j].sort_key.clone());
        let after = siblings.get(i + 1).map(|t| t.sort_key.clone());
        (before, after)
    }

    /// One whole-array `dependencies` change per survivor that links to any
    /// of `targets`.
    fn ghost_link_changes(&self, targets: &HashSet<&TaskId>) -> Vec<(TaskId, FieldChange)> {
        self.tasks
            .iter()
            .filter(|t| !targets.contains(&t.id))
            .filter_map(|t| {
                let kept: Vec<Dependency> = t
                    .dependencies
                    .iter()
                    .filter(|d| !targets.contains(&d.id))
                    .cloned()
                    .collect();
                (kept.len() != t.dependencies.len()).then(|| {
                    (
                        t.id.clone(),
                        FieldChange::Dependencies {
                            old_value: t.dependencies.clone(),
                            new_value: kept,
                        },
                    )
                })
            })
            .collect()
    }
}
