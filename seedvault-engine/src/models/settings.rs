use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

/// Read a setting and parse it, ignoring values that do not parse.
pub fn get_parsed<T: FromStr>(conn: &Connection, key: &str) -> anyhow::Result<Option<T>> {
    let value = get(conn, key)?;
    Ok(value.and_then(|v| match v.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %v, "Ignoring unparseable setting");
            None
        }
    }))
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn remove(conn: &Connection, key: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM settings WHERE key = ?", params![key])?;
    Ok(changes > 0)
}
