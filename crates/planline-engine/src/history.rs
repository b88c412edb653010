//! Undo/redo history.
//!
//! Every user-visible mutation is recorded as a [`HistoryAction`]: the
//! forward events that performed it and the backward events that revert it.
//! `backward[i]` is the inverse of an entry in `forward`, stored in forward
//! order; undo replays the backward list reversed.
//!
//! Related mutations can be grouped with [`HistoryManager::begin_composite`]
//! so they undo as one step.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use planline_core::TaskEvent;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::HistoryError;

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryAction {
    pub forward: Vec<TaskEvent>,
    pub backward: Vec<TaskEvent>,
    pub label: String,
}

/// What subscribers see after every change to the stacks.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistoryState {
    pub can_undo: bool,
    pub can_redo: bool,
    pub undo_label: Option<String>,
    pub redo_label: Option<String>,
    pub in_composite: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn Fn(&HistoryState) + Send + Sync>;

enum Mode {
    Idle,
    InComposite(HistoryAction),
}

pub struct HistoryManager {
    undo_stack: VecDeque<HistoryAction>,
    redo_stack: Vec<HistoryAction>,
    max_history: usize,
    mode: Mode,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl HistoryManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_history: max_history.max(1),
            mode: Mode::Idle,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn in_composite(&self) -> bool {
        matches!(self.mode, Mode::InComposite(_))
    }

    pub fn begin_composite(&mut self, label: impl Into<String>) -> Result<(), HistoryError> {
        if let Mode::InComposite(open) = &self.mode {
            return Err(HistoryError::NestedComposite(open.label.clone()));
        }
        self.mode = Mode::InComposite(HistoryAction {
            forward: Vec::new(),
            backward: Vec::new(),
            label: label.into(),
        });
        Ok(())
    }

    /// Record one action, or fold it into the open composite.
    pub fn record_action(
        &mut self,
        forward: Vec<TaskEvent>,
        backward: Vec<TaskEvent>,
        label: impl Into<String>,
    ) {
        if let Mode::InComposite(open) = &mut self.mode {
            open.forward.extend(forward);
            open.backward.extend(backward);
            return;
        }
        self.record(HistoryAction {
            forward,
            backward,
            label: label.into(),
        });
    }

    /// Push a complete action onto the undo stack and clear redo.
    pub fn record(&mut self, action: HistoryAction) {
        self.redo_stack.clear();
        self.undo_stack.push_back(action);
        while self.undo_stack.len() > self.max_history {
            let _ = self.undo_stack.pop_front();
        }
        self.notify();
    }

    /// Close the open composite. Returns `true` when it held anything and was
    /// pushed.
    pub fn end_composite(&mut self) -> Result<bool, HistoryError> {
        let Mode::InComposite(action) = std::mem::replace(&mut self.mode, Mode::Idle) else {
            return Err(HistoryError::NoComposite);
        };
        if action.forward.is_empty() && action.backward.is_empty() {
            debug!(label = %action.label, "empty composite discarded");
            self.notify();
            return Ok(false);
        }
        self.record(action);
        Ok(true)
    }

    /// Drop the open composite. Returns its backward events, reversed, so the
    /// caller can revert whatever it already applied.
    pub fn cancel_composite(&mut self) -> Result<Vec<TaskEvent>, HistoryError> {
        let Mode::InComposite(action) = std::mem::replace(&mut self.mode, Mode::Idle) else {
            return Err(HistoryError::NoComposite);
        };
        self.notify();
        Ok(action.backward.into_iter().rev().collect())
    }

    /// Events that revert the newest action, in application order. `None`
    /// when there is nothing to undo or a composite is open.
    pub fn undo(&mut self) -> Option<Vec<TaskEvent>> {
        if self.in_composite() {
            debug!("undo ignored while a composite is open");
            return None;
        }
        let action = self.undo_stack.pop_back()?;
        let events = action.backward.iter().rev().cloned().collect();
        self.redo_stack.push(action);
        self.notify();
        Some(events)
    }

    /// Events that reapply the newest undone action, in application order.
    pub fn redo(&mut self) -> Option<Vec<TaskEvent>> {
        if self.in_composite() {
            debug!("redo ignored while a composite is open");
            return None;
        }
        let action = self.redo_stack.pop()?;
        let events = action.forward.clone();
        self.undo_stack.push_back(action);
        self.notify();
        Some(events)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.back().map(|a| a.label.as_str())
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.redo_stack.last().map(|a| a.label.as_str())
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.mode = Mode::Idle;
        self.notify();
    }

    pub fn state(&self) -> HistoryState {
        HistoryState {
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
            undo_label: self.undo_label().map(str::to_owned),
            redo_label: self.redo_label().map(str::to_owned),
            in_composite: self.in_composite(),
        }
    }

    pub fn subscribe(&mut self, f: impl Fn(&HistoryState) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(f)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        self.subscribers.len() != before
    }

    fn notify(&self) {
        if self.subscribers.is_empty() {
            return;
        }
        let state = self.state();
        for (id, subscriber) in &self.subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&state))).is_err() {
                error!(subscription = id.0, "history subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use planline_core::{Task, TaskId};
    use std::sync::Arc;

    fn created(id: &str) -> TaskEvent {
        TaskEvent::created(Task::new(id, id))
    }

    fn deleted(id: &str) -> TaskEvent {
        TaskEvent::deleted(&TaskId::from_raw(id))
    }

    fn record_add(history: &mut HistoryManager, id: &str) {
        history.record_action(vec![created(id)], vec![deleted(id)], format!("Add {id}"));
    }

    #[test]
    fn undo_returns_backward_events() {
        let mut history = HistoryManager::new(100);
        record_add(&mut history, "A");
        assert!(history.can_undo());
        assert_eq!(history.undo_label(), Some("Add A"));

        let events = history.undo().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "TASK_DELETED");
        assert_eq!(events[0].target_id, "A");
        assert!(!history.can_undo());
        assert!(history.can_redo());
    }

    #[test]
    fn redo_returns_forward_events() {
        let mut history = HistoryManager::new(100);
        record_add(&mut history, "A");
        history.undo();
        let events = history.redo().unwrap();
        assert_eq!(events[0].event_type(), "TASK_CREATED");
        assert!(history.can_undo());
        assert!(!history.can_redo());
    }

    #[test]
    fn recording_clears_redo() {
        let mut history = HistoryManager::new(100);
        record_add(&mut history, "A");
        history.undo();
        record_add(&mut history, "B");
        assert!(!history.can_redo());
        assert_eq!(history.redo(), None);
    }

    #[test]
    fn composite_undoes_in_reverse() {
        let mut history = HistoryManager::new(100);
        history.begin_composite("Import").unwrap();
        record_add(&mut history, "A");
        record_add(&mut history, "B");
        assert!(!history.can_undo());
        assert!(history.end_composite().unwrap());

        assert_eq!(history.undo_label(), Some("Import"));
        let targets: Vec<String> = history
            .undo()
            .unwrap()
            .into_iter()
            .map(|e| e.target_id)
            .collect();
        assert_eq!(targets, vec!["B", "A"]);
    }

    #[test]
    fn nested_composite_is_rejected() {
        let mut history = HistoryManager::new(100);
        history.begin_composite("outer").unwrap();
        assert_eq!(
            history.begin_composite("inner"),
            Err(HistoryError::NestedComposite("outer".into()))
        );
    }

    #[test]
    fn empty_composite_is_not_pushed() {
        let mut history = HistoryManager::new(100);
        history.begin_composite("nothing").unwrap();
        assert!(!history.end_composite().unwrap());
        assert!(!history.can_undo());
        assert_eq!(history.end_composite(), Err(HistoryError::NoComposite));
    }

    #[test]
    fn cancel_returns_revert_events() {
        let mut history = HistoryManager::new(100);
        history.begin_composite("Import").unwrap();
        record_add(&mut history, "A");
        record_add(&mut history, "B");
        let revert = history.cancel_composite().unwrap();
        let targets: Vec<&str> = revert.iter().map(|e| e.target_id.as_str()).collect();
        assert_eq!(targets, vec!["B", "A"]);
        assert!(!history.can_undo());
        assert!(!history.in_composite());
    }

    #[test]
    fn undo_is_blocked_inside_composite() {
        let mut history = HistoryManager::new(100);
        record_add(&mut history, "A");
        history.begin_composite("batch").unwrap();
        assert_eq!(history.undo(), None);
        assert!(history.can_undo());
    }

    #[test]
    fn max_history_evicts_oldest() {
        let mut history = HistoryManager::new(3);
        for id in ["A", "B", "C", "D"] {
            record_add(&mut history, id);
        }
        let mut undone = Vec::new();
        while let Some(events) = history.undo() {
            undone.push(events[0].target_id.clone());
        }
        assert_eq!(undone, vec!["D", "C", "B"]);
    }

    #[test]
    fn subscribers_see_every_change() {
        let mut history = HistoryManager::new(100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = history.subscribe(move |state| sink.lock().push(state.clone()));

        record_add(&mut history, "A");
        history.undo();
        assert!(history.unsubscribe(id));
        history.redo();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].can_undo && !seen[0].can_redo);
        assert!(!seen[1].can_undo && seen[1].can_redo);
        assert_eq!(seen[1].redo_label.as_deref(), Some("Add A"));
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let mut history = HistoryManager::new(100);
        let calls = Arc::new(Mutex::new(0));
        history.subscribe(|_| panic!("subscriber bug"));
        let counter = Arc::clone(&calls);
        history.subscribe(move |_| *counter.lock() += 1);

        record_add(&mut history, "A");
        history.undo();
        assert_eq!(*calls.lock(), 2);
    }
}
