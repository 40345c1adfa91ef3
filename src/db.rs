use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

use crate::catalog::BUILTIN_BELTS;

pub const DB_FILE: &str = "dojo.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!("failed to create workspace {}", workspace.to_string_lossy())
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS belt_catalog(
            id INTEGER PRIMARY KEY,
            key TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            max_degrees INTEGER NOT NULL DEFAULT 0,
            color TEXT NOT NULL
        )",
        [],
    )?;
    seed_belt_catalog(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT,
            photo_url TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            current_rank TEXT,
            current_degree INTEGER,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Workspaces created before the legacy belt columns existed.
    ensure_students_legacy_belt(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_profiles(
            student_id TEXT PRIMARY KEY,
            belt_id INTEGER,
            belt_name TEXT,
            degree INTEGER,
            started_on TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(belt_id) REFERENCES belt_catalog(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS gradings(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            previous_rank TEXT,
            previous_degree INTEGER,
            new_rank TEXT,
            new_degree INTEGER,
            graded_on TEXT NOT NULL,
            evaluator_id TEXT,
            status TEXT,
            created_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_gradings_student ON gradings(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            status TEXT NOT NULL,
            number INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_group ON enrollments(group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            group_id TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_sessions(
            id TEXT PRIMARY KEY,
            class_id TEXT,
            session_date TEXT NOT NULL,
            status TEXT,
            substitute_instructor_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // No uniqueness on (student_id, class_session_id): replace-on-write keeps
    // one row per pair.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_session_id TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT,
            recorded_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_session_id) REFERENCES class_sessions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance_records(class_session_id)",
        [],
    )?;

    Ok(())
}

fn seed_belt_catalog(conn: &Connection) -> anyhow::Result<()> {
    for (i, (key, name, max_degrees, color)) in BUILTIN_BELTS.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO belt_catalog(id, key, name, sort_order, max_degrees, color)
             VALUES(?, ?, ?, ?, ?, ?)",
            (i as i64 + 1, key, name, i as i64 + 1, *max_degrees as i64, color),
        )
        .with_context(|| format!("failed to seed belt {}", key))?;
    }
    Ok(())
}

fn ensure_students_legacy_belt(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "current_rank")? {
        conn.execute("ALTER TABLE students ADD COLUMN current_rank TEXT", [])?;
    }
    if !table_has_column(conn, "students", "current_degree")? {
        conn.execute("ALTER TABLE students ADD COLUMN current_degree INTEGER", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(
            serde_json::from_str(&text).with_context(|| format!("setting {} is invalid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
