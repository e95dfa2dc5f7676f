// src/db/mod.rs

//! Image database
//!
//! Installed set, image configuration and linked-image relations live in one
//! SQLite file under the image's metadata directory. Writers replace the whole
//! state inside one SQL transaction, so readers never see a half-written state.

pub mod relations;
pub mod schema;
pub mod state;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::{debug, info};

/// Create (or upgrade) the image database at `db_path`
///
/// Idempotent: calling it on an existing database only applies pending
/// migrations.
pub fn init(db_path: &Path) -> Result<Connection> {
    debug!("Initializing image database at: {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = FULL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;
    info!("Image database ready at {}", db_path.display());
    Ok(conn)
}

/// Open an existing image database
pub fn open(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        return Err(Error::ImageNotFound(db_path.display().to_string()));
    }

    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "
        PRAGMA synchronous = FULL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) fn test_connection() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    schema::migrate(&conn).unwrap();
    conn
}
