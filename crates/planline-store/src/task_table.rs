//! Materialized `tasks` table.
//!
//! The table holds authoritative input state only. Rows are written from
//! the serde form of [`Task`] (which already omits derived fields) through a
//! static field→column map, and read back the same way, so the persisted
//! shape can never drift from the in-memory model.

use std::sync::LazyLock;

use planline_core::{Calendar, EventKind, FieldChange, Task, TaskEvent, TaskId};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Real,
    Bool,
    Json,
}

struct Column {
    field: &'static str,
    column: &'static str,
    kind: ColumnKind,
}

const fn col(field: &'static str, column: &'static str, kind: ColumnKind) -> Column {
    Column {
        field,
        column,
        kind,
    }
}

const COLUMNS: &[Column] = &[
    col("id", "id", ColumnKind::Text),
    col("parent_id", "parent_id", ColumnKind::Text),
    col("sort_key", "sort_key", ColumnKind::Text),
    col("row_type", "row_type", ColumnKind::Text),
    col("name", "name", ColumnKind::Text),
    col("notes", "notes", ColumnKind::Text),
    col("duration", "duration", ColumnKind::Real),
    col("constraint_type", "constraint_type", ColumnKind::Text),
    col("constraint_date", "constraint_date", ColumnKind::Text),
    col("scheduling_mode", "scheduling_mode", ColumnKind::Text),
    col("dependencies", "dependencies_json", ColumnKind::Json),
    col("progress", "progress", ColumnKind::Real),
    col("actual_start", "actual_start", ColumnKind::Text),
    col("actual_finish", "actual_finish", ColumnKind::Text),
    col("remaining_duration", "remaining_duration", ColumnKind::Real),
    col("baseline_start", "baseline_start", ColumnKind::Text),
    col("baseline_finish", "baseline_finish", ColumnKind::Text),
    col("baseline_duration", "baseline_duration", ColumnKind::Real),
    col("is_collapsed", "is_collapsed", ColumnKind::Bool),
];

static UPSERT_SQL: LazyLock<String> = LazyLock::new(|| {
    let names: Vec<&str> = COLUMNS.iter().map(|c| c.column).collect();
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = COLUMNS
        .iter()
        .skip(1)
        .map(|c| format!("{0} = excluded.{0}", c.column))
        .collect();
    format!(
        "INSERT INTO tasks ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        names.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
});

static SELECT_COLUMNS: LazyLock<String> = LazyLock::new(|| {
    let names: Vec<&str> = COLUMNS.iter().map(|c| c.column).collect();
    names.join(", ")
});

fn column_for(field: &str) -> Result<&'static Column, StoreError> {
    COLUMNS
        .iter()
        .find(|c| c.field == field)
        .ok_or_else(|| StoreError::Serialization(format!("no column for field {field}")))
}

fn to_sql(value: &Value, column: &Column) -> Result<SqlValue, StoreError> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let mismatch = || {
        StoreError::Serialization(format!("unexpected value for {}: {value}", column.column))
    };
    match column.kind {
        ColumnKind::Text => value
            .as_str()
            .map(|s| SqlValue::Text(s.to_owned()))
            .ok_or_else(mismatch),
        ColumnKind::Real => value.as_f64().map(SqlValue::Real).ok_or_else(mismatch),
        ColumnKind::Bool => value
            .as_bool()
            .map(|b| SqlValue::Integer(i64::from(b)))
            .ok_or_else(mismatch),
        ColumnKind::Json => Ok(SqlValue::Text(serde_json::to_string(value)?)),
    }
}

fn from_sql(value: SqlValue, column: &Column) -> Result<Value, StoreError> {
    let corrupt = |detail: String| StoreError::CorruptRow {
        table: "tasks",
        column: column.column,
        detail,
    };
    Ok(match (column.kind, value) {
        (_, SqlValue::Null) => Value::Null,
        (ColumnKind::Text, SqlValue::Text(s)) => Value::String(s),
        (ColumnKind::Real, SqlValue::Real(f)) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| corrupt(format!("non-finite number {f}")))?,
        (ColumnKind::Real, SqlValue::Integer(i)) => Value::from(i),
        (ColumnKind::Bool, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (ColumnKind::Json, SqlValue::Text(s)) => {
            row_helpers::parse_json(&s, "tasks", column.column)?
        }
        (kind, other) => return Err(corrupt(format!("expected {kind:?}, got {other:?}"))),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<Task, StoreError> {
    let mut object = serde_json::Map::with_capacity(COLUMNS.len());
    for (idx, column) in COLUMNS.iter().enumerate() {
        let raw: SqlValue = row_helpers::get(row, idx, "tasks", column.column)?;
        let _ = object.insert(column.field.to_string(), from_sql(raw, column)?);
    }
    serde_json::from_value(Value::Object(object)).map_err(|e| StoreError::CorruptRow {
        table: "tasks",
        column: "*",
        detail: e.to_string(),
    })
}

pub struct TaskTable;

impl TaskTable {
    /// Insert or overwrite a task row. Idempotent.
    pub fn upsert(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        let value = serde_json::to_value(task)?;
        let values = COLUMNS
            .iter()
            .map(|column| to_sql(&value[column.field], column))
            .collect::<Result<Vec<_>, _>>()?;
        let _ = conn.execute(&UPSERT_SQL, params_from_iter(values))?;
        Ok(())
    }

    /// Write a single field. A missing row is left missing.
    pub fn apply_change(conn: &Connection, id: &TaskId, change: &FieldChange) -> Result<(), StoreError> {
        let column = column_for(change.field_name())?;
        let encoded = serde_json::to_value(change)?;
        let value = to_sql(&encoded["new_value"], column)?;
        let sql = format!("UPDATE tasks SET {} = ?1 WHERE id = ?2", column.column);
        let updated = conn.execute(&sql, params![value, id.as_str()])?;
        if updated == 0 {
            debug!(task_id = %id, field = change.field_name(), "update for missing task row");
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &TaskId) -> Result<(), StoreError> {
        let _ = conn.execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])?;
        Ok(())
    }

    /// All rows in physical (insertion) order.
    #[instrument(skip(conn))]
    pub fn load_all(conn: &Connection) -> Result<Vec<Task>, StoreError> {
        let sql = format!("SELECT {} FROM tasks ORDER BY rowid ASC", *SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)?);
        }
        Ok(tasks)
    }

    pub fn get(conn: &Connection, id: &TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", *SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_task(row)?)),
            None => Ok(None),
        }
    }

    pub fn count(conn: &Connection) -> Result<i64, StoreError> {
        Ok(conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
    }

    /// Replace the whole table, keeping the given order as physical order.
    pub fn replace_all(conn: &Connection, tasks: &[Task]) -> Result<(), StoreError> {
        let _ = conn.execute("DELETE FROM tasks", [])?;
        for task in tasks {
            Self::upsert(conn, task)?;
        }
        Ok(())
    }

    pub fn save_calendar(conn: &Connection, calendar: &Calendar) -> Result<(), StoreError> {
        let _ = conn.execute(
            "INSERT INTO calendar (id, calendar_json) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET calendar_json = excluded.calendar_json",
            [serde_json::to_string(calendar)?],
        )?;
        Ok(())
    }

    pub fn load_calendar(conn: &Connection) -> Result<Option<Calendar>, StoreError> {
        let raw: Option<String> = conn
            .query_row("SELECT calendar_json FROM calendar WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        raw.map(|raw| row_helpers::parse_json(&raw, "calendar", "calendar_json"))
            .transpose()
    }

    /// Project one event onto the materialized state.
    pub fn project(conn: &Connection, event: &TaskEvent) -> Result<(), StoreError> {
        match &event.kind {
            EventKind::TaskCreated(task) => Self::upsert(conn, task),
            EventKind::TaskUpdated(change) => Self::apply_change(conn, &event.task_id(), change),
            EventKind::TaskDeleted {} => Self::delete(conn, &event.task_id()),
            EventKind::CalendarUpdated(calendar) => Self::save_calendar(conn, calendar),
            EventKind::ProjectImported { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use chrono::NaiveDate;
    use planline_core::{ConstraintType, Dependency, DependencyType, RowType, SchedulingMode};
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    fn full_task() -> Task {
        let mut task = Task {
            id: TaskId::from_raw("A"),
            parent_id: Some(TaskId::from_raw("P")),
            sort_key: "V".into(),
            row_type: RowType::Task,
            name: "Pour foundation".into(),
            notes: "needs dry weather".into(),
            duration: 4.5,
            constraint_type: ConstraintType::Snet,
            constraint_date: date(2024, 3, 4),
            scheduling_mode: SchedulingMode::Manual,
            dependencies: vec![Dependency {
                id: TaskId::from_raw("Z"),
                kind: DependencyType::SS,
                lag: -2,
            }],
            progress: 37.5,
            actual_start: date(2024, 3, 4),
            actual_finish: None,
            remaining_duration: Some(2.0),
            baseline_start: date(2024, 3, 1),
            baseline_finish: date(2024, 3, 6),
            baseline_duration: Some(4.0),
            is_collapsed: true,
            ..Task::default()
        };
        task.display_order = 3;
        task.schedule.is_critical = true;
        task.schedule.start = date(2024, 3, 4);
        task
    }

    #[test]
    fn upsert_then_load_strips_derived_fields() {
        let db = Database::in_memory().unwrap();
        let task = full_task();
        db.with_conn(|c| TaskTable::upsert(c, &task)).unwrap();

        let loaded = db.with_conn(TaskTable::load_all).unwrap();
        assert_eq!(loaded, vec![task.stripped()]);
    }

    #[test]
    fn upsert_is_idempotent() {
        let db = Database::in_memory().unwrap();
        let task = full_task();
        db.with_conn(|c| {
            TaskTable::upsert(c, &task)?;
            TaskTable::upsert(c, &task)
        })
        .unwrap();
        assert_eq!(db.with_conn(TaskTable::count).unwrap(), 1);
    }

    #[test]
    fn apply_change_writes_single_column() {
        let db = Database::in_memory().unwrap();
        let task = full_task();
        db.with_conn(|c| {
            TaskTable::upsert(c, &task)?;
            TaskTable::apply_change(
                c,
                &task.id,
                &FieldChange::Dependencies {
                    old_value: task.dependencies.clone(),
                    new_value: vec![],
                },
            )?;
            TaskTable::apply_change(
                c,
                &task.id,
                &FieldChange::ActualStart {
                    old_value: task.actual_start,
                    new_value: None,
                },
            )
        })
        .unwrap();

        let loaded = db.with_conn(|c| TaskTable::get(c, &task.id)).unwrap().unwrap();
        assert!(loaded.dependencies.is_empty());
        assert_eq!(loaded.actual_start, None);
        assert_eq!(loaded.name, task.name);
    }

    #[test]
    fn change_for_missing_row_is_a_no_op() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|c| {
            TaskTable::apply_change(
                c,
                &TaskId::from_raw("ghost"),
                &FieldChange::Name {
                    old_value: String::new(),
                    new_value: "x".into(),
                },
            )
        })
        .unwrap();
        assert_eq!(db.with_conn(TaskTable::count).unwrap(), 0);
    }

    #[test]
    fn project_covers_task_lifecycle() {
        let db = Database::in_memory().unwrap();
        let id = TaskId::from_raw("A");
        db.with_conn(|c| {
            TaskTable::project(c, &TaskEvent::created(Task::new("A", "Design")))?;
            TaskTable::project(
                c,
                &TaskEvent::updated(
                    &id,
                    FieldChange::IsCollapsed {
                        old_value: false,
                        new_value: true,
                    },
                ),
            )
        })
        .unwrap();
        let loaded = db.with_conn(|c| TaskTable::get(c, &id)).unwrap().unwrap();
        assert!(loaded.is_collapsed);

        db.with_conn(|c| TaskTable::project(c, &TaskEvent::deleted(&id))).unwrap();
        assert_eq!(db.with_conn(TaskTable::count).unwrap(), 0);
    }

    #[test]
    fn calendar_roundtrip() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.with_conn(TaskTable::load_calendar).unwrap(), None);

        let calendar = Calendar {
            hours_per_day: 7.0,
            holidays: date(2024, 12, 25).into_iter().collect(),
            ..Calendar::default()
        };
        db.with_conn(|c| TaskTable::project(c, &TaskEvent::calendar_updated(calendar.clone())))
            .unwrap();
        assert_eq!(db.with_conn(TaskTable::load_calendar).unwrap(), Some(calendar));
    }

    #[test]
    fn load_preserves_physical_order() {
        let db = Database::in_memory().unwrap();
        let tasks: Vec<Task> = ["C", "A", "B"].iter().map(|id| Task::new(*id, *id)).collect();
        db.with_conn(|c| TaskTable::replace_all(c, &tasks)).unwrap();

        let ids: Vec<String> = db
            .with_conn(TaskTable::load_all)
            .unwrap()
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    fn arb_date() -> impl Strategy<Value = Option<NaiveDate>> {
        proptest::option::of((2000i32..2040, 1u32..13, 1u32..29).prop_map(|(y, m, d)| {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }))
    }

    prop_compose! {
        fn arb_task()(
            name in "[a-zA-Z0-9 ]{0,24}",
            notes in ".{0,40}",
            duration in 0.0f64..1000.0,
            progress in 0.0f64..=100.0,
            blank in any::<bool>(),
            collapsed in any::<bool>(),
            start in arb_date(),
            finish in arb_date(),
            lags in proptest::collection::vec(-10i32..10, 0..4),
        ) -> Task {
            Task {
                id: TaskId::new(),
                name,
                notes,
                duration,
                progress,
                row_type: if blank { RowType::Blank } else { RowType::Task },
                is_collapsed: collapsed,
                actual_start: start,
                baseline_finish: finish,
                dependencies: lags
                    .into_iter()
                    .map(|lag| Dependency { id: TaskId::new(), kind: DependencyType::FF, lag })
                    .collect(),
                ..Task::default()
            }
        }
    }

    proptest! {
        #[test]
        fn persisted_tasks_hydrate_unchanged(task in arb_task()) {
            let db = Database::in_memory().unwrap();
            db.with_conn(|c| TaskTable::upsert(c, &task)).unwrap();
            let loaded = db.with_conn(|c| TaskTable::get(c, &task.id)).unwrap().unwrap();
            prop_assert_eq!(loaded, task.stripped());
        }
    }
}
