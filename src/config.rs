//! Per-workspace settings.
//!
//! Each section is a JSON object stored under `setup.<section>` in the
//! `settings` table. Reads start from the defaults and apply whatever stored
//! fields still validate, so a bad historical value never blocks a workspace.

use std::time::Duration;

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::db;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Import,
    Storage,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Import, SetupSection::Storage];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import" => Some(Self::Import),
            "storage" => Some(Self::Storage),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Storage => "storage",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::Import => "setup.import",
            Self::Storage => "setup.storage",
        }
    }

    fn defaults(self) -> Value {
        match self {
            Self::Import => json!({
                "maxRows": 5000,
                "deadlineMs": 30000
            }),
            Self::Storage => json!({
                "busyTimeoutMs": 5000
            }),
        }
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn apply_field(section: SetupSection, obj: &mut Map<String, Value>, k: &str, v: &Value) -> Result<(), String> {
    match section {
        SetupSection::Import => match k {
            "maxRows" => {
                obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 1, 50_000)?));
            }
            "deadlineMs" => {
                obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 0, 600_000)?));
            }
            _ => return Err(format!("unknown import field: {}", k)),
        },
        SetupSection::Storage => match k {
            "busyTimeoutMs" => {
                obj.insert(k.to_string(), Value::from(parse_i64_range(v, k, 0, 60_000)?));
            }
            _ => return Err(format!("unknown storage field: {}", k)),
        },
    }
    Ok(())
}

/// Applies a patch atomically: either every field validates or `current` is
/// left untouched.
pub fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let mut next = current
        .as_object()
        .cloned()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        apply_field(section, &mut next, k, v)?;
    }
    *current = Value::Object(next);
    Ok(())
}

pub fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = section.defaults();
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let (Some(saved_obj), Some(obj)) = (saved.as_object(), current.as_object_mut()) {
            for (k, v) in saved_obj {
                let _ = apply_field(section, obj, k, v);
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> Result<Value, SettingsError> {
    let mut current = load_section(conn, section).map_err(SettingsError::Storage)?;
    merge_section_patch(section, &mut current, patch).map_err(SettingsError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current).map_err(SettingsError::Storage)?;
    Ok(current)
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSettings {
    pub max_rows: usize,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSettings {
    pub busy_timeout: Duration,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

fn field_u64(section: &Value, key: &str) -> u64 {
    section.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

pub fn import_settings(conn: &Connection) -> anyhow::Result<ImportSettings> {
    let s = load_section(conn, SetupSection::Import)?;
    let deadline_ms = field_u64(&s, "deadlineMs");
    Ok(ImportSettings {
        max_rows: field_u64(&s, "maxRows") as usize,
        deadline: (deadline_ms > 0).then(|| Duration::from_millis(deadline_ms)),
    })
}

pub fn storage_settings(conn: &Connection) -> anyhow::Result<StorageSettings> {
    let s = load_section(conn, SetupSection::Storage)?;
    Ok(StorageSettings {
        busy_timeout: Duration::from_millis(field_u64(&s, "busyTimeoutMs")),
    })
}
