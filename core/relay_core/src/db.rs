use rusqlite::{Connection, OptionalExtension};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::quiet::{QuietWindow, TimeOfDay};
use crate::settings::{Settings, MAX_HISTORY_CAPACITY};

pub const KEY_HISTORY: &str = "history";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_REGISTRATION_ID: &str = "registration_id";
pub const KEY_SYNC_STATUS: &str = "sync_status";

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS app_settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  history_capacity INTEGER NOT NULL,
  quiet_enabled INTEGER NOT NULL DEFAULT 0,
  quiet_start TEXT NOT NULL DEFAULT '00:00',
  quiet_end TEXT NOT NULL DEFAULT '00:00',
  groups_json TEXT NOT NULL DEFAULT '[]',
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS app_state (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )
}

struct SettingsRow {
    history_capacity: i64,
    quiet_enabled: bool,
    quiet_start: String,
    quiet_end: String,
    groups_json: String,
}

/// Loads the persisted settings, repairing out-of-range or unparseable values
/// (and writing the repaired row back). Falls back to `defaults` on first run.
pub fn load_or_init_settings(conn: &mut Connection, defaults: &Settings) -> rusqlite::Result<Settings> {
    let Some(row) = load_settings_row(conn)? else {
        let fixed = Settings {
            history_capacity: defaults.history_capacity.min(MAX_HISTORY_CAPACITY),
            ..defaults.clone()
        };
        upsert_app_settings(conn, &fixed, &now_rfc3339())?;
        return Ok(fixed);
    };

    let fixed = Settings {
        history_capacity: row.history_capacity.clamp(0, MAX_HISTORY_CAPACITY as i64) as u32,
        quiet: QuietWindow {
            enabled: row.quiet_enabled,
            start: row.quiet_start.parse().unwrap_or(TimeOfDay::MIDNIGHT),
            end: row.quiet_end.parse().unwrap_or(TimeOfDay::MIDNIGHT),
        },
        groups: serde_json::from_str(&row.groups_json).unwrap_or_else(|_| defaults.groups.clone()),
    };

    let unchanged = fixed.history_capacity as i64 == row.history_capacity
        && fixed.quiet.start.to_string() == row.quiet_start
        && fixed.quiet.end.to_string() == row.quiet_end
        && serde_json::to_string(&fixed.groups).ok().as_deref() == Some(row.groups_json.as_str());
    if !unchanged {
        upsert_app_settings(conn, &fixed, &now_rfc3339())?;
    }
    Ok(fixed)
}

fn load_settings_row(conn: &mut Connection) -> rusqlite::Result<Option<SettingsRow>> {
    let mut stmt = conn.prepare(
        "SELECT history_capacity, quiet_enabled, quiet_start, quiet_end, groups_json FROM app_settings WHERE id = 1",
    )?;
    let row = stmt
        .query_row([], |row| {
            let quiet_enabled: i64 = row.get(1)?;
            Ok(SettingsRow {
                history_capacity: row.get(0)?,
                quiet_enabled: quiet_enabled != 0,
                quiet_start: row.get(2)?,
                quiet_end: row.get(3)?,
                groups_json: row.get(4)?,
            })
        })
        .optional()?;
    Ok(row)
}

pub fn upsert_app_settings(
    conn: &mut Connection,
    settings: &Settings,
    updated_at: &str,
) -> rusqlite::Result<()> {
    let groups_json = serde_json::to_string(&settings.groups)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        r#"
INSERT INTO app_settings (id, history_capacity, quiet_enabled, quiet_start, quiet_end, groups_json, updated_at)
VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(id) DO UPDATE SET
  history_capacity=excluded.history_capacity,
  quiet_enabled=excluded.quiet_enabled,
  quiet_start=excluded.quiet_start,
  quiet_end=excluded.quiet_end,
  groups_json=excluded.groups_json,
  updated_at=excluded.updated_at
        "#,
        (
            settings.history_capacity as i64,
            settings.quiet.enabled as i64,
            settings.quiet.start.to_string(),
            settings.quiet.end.to_string(),
            groups_json,
            updated_at,
        ),
    )?;
    Ok(())
}

pub fn get_state(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM app_state WHERE key = ?1", [key], |row| row.get(0))
        .optional()
}

pub fn put_state(conn: &Connection, key: &str, value: &str, updated_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO app_state (key, value, updated_at) VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
        "#,
        (key, value, updated_at),
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_db(&conn).unwrap();
    conn
}
