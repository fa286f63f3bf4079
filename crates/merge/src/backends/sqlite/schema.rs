//! SQLite schema definitions.

use rusqlite::Connection;

use crate::error::{StorageError, StorageResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Creates the tables if needed.
pub fn initialize_schema(conn: &Connection) -> StorageResult<()> {
    let current_version = get_schema_version(conn)?;
    if current_version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(internal_error(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

fn get_schema_version(conn: &Connection) -> StorageResult<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )
    .map_err(|e| internal_error(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| internal_error(format!("Failed to clear schema_version: {}", e)))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])
        .map_err(|e| internal_error(format!("Failed to set schema_version: {}", e)))?;
    Ok(())
}

fn create_schema_v1(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS resources (
            resource_type TEXT NOT NULL,
            surrogate_id TEXT NOT NULL,
            logical_id TEXT NOT NULL,
            owning_authority TEXT NOT NULL,
            version INTEGER NOT NULL,
            last_modified TEXT NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (resource_type, surrogate_id)
        );

        CREATE TABLE IF NOT EXISTS resource_history (
            resource_type TEXT NOT NULL,
            surrogate_id TEXT NOT NULL,
            logical_id TEXT NOT NULL,
            owning_authority TEXT NOT NULL,
            version INTEGER NOT NULL,
            last_modified TEXT NOT NULL,
            data TEXT NOT NULL,
            request_id TEXT NOT NULL,
            superseded_at TEXT NOT NULL,
            method TEXT NOT NULL,
            PRIMARY KEY (resource_type, surrogate_id, version)
        );

        CREATE INDEX IF NOT EXISTS idx_history_last_modified
            ON resource_history (resource_type, last_modified DESC);",
    )
    .map_err(|e| internal_error(format!("Failed to create schema: {}", e)))
}

fn internal_error(message: String) -> StorageError {
    StorageError::Internal {
        backend_name: "sqlite".to_string(),
        message,
        source: None,
    }
}
