/// SQL DDL for the planline database.
/// `events` is append-only; `tasks` is the materialized projection of it.
/// `dead_events` holds events that could never be written.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    sort_key TEXT NOT NULL DEFAULT '',
    row_type TEXT NOT NULL DEFAULT 'task',
    name TEXT NOT NULL DEFAULT '',
    notes TEXT NOT NULL DEFAULT '',
    duration REAL NOT NULL DEFAULT 1.0,
    constraint_type TEXT NOT NULL DEFAULT 'ASAP',
    constraint_date TEXT,
    scheduling_mode TEXT NOT NULL DEFAULT 'Auto',
    dependencies_json TEXT NOT NULL DEFAULT '[]',
    progress REAL NOT NULL DEFAULT 0,
    actual_start TEXT,
    actual_finish TEXT,
    remaining_duration REAL,
    baseline_start TEXT,
    baseline_finish TEXT,
    baseline_duration REAL,
    is_collapsed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS snapshots (
    event_id TEXT,
    tasks_json TEXT NOT NULL,
    calendar_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calendar (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    calendar_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_events (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_target ON events(target_id);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
