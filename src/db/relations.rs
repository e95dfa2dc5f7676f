// src/db/relations.rs

//! Linked-image relation table
//!
//! The parent image records each child by path; the child owns its own state.

use crate::error::{Error, Result};
use crate::linked::{ChildRelation, ChildState, LinkPolicy};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::PathBuf;
use std::str::FromStr;

fn from_row(row: &Row) -> rusqlite::Result<(String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: (String, String, String, String)) -> Result<ChildRelation> {
    let (path, name, policy, state) = raw;
    let policy = LinkPolicy::from_str(&policy)
        .map_err(|_| Error::InvalidOperation(format!("unknown link policy '{}'", policy)))?;
    let state = ChildState::from_str(&state)
        .map_err(|_| Error::InvalidOperation(format!("unknown child state '{}'", state)))?;
    Ok(ChildRelation {
        name,
        path: PathBuf::from(path),
        policy,
        state,
    })
}

/// Record a new child; attaching the same path twice is an error
pub fn insert(conn: &Connection, child: &ChildRelation) -> Result<()> {
    let path = child.path.display().to_string();
    if find_by_path(conn, &path)?.is_some() {
        return Err(Error::InvalidOperation(format!(
            "{} is already attached",
            path
        )));
    }
    conn.execute(
        "INSERT INTO linked_children (child_path, name, policy, state) VALUES (?1, ?2, ?3, ?4)",
        params![
            path,
            child.name,
            child.policy.to_string(),
            child.state.to_string()
        ],
    )?;
    Ok(())
}

pub fn update_state(conn: &Connection, path: &str, state: ChildState) -> Result<()> {
    let changed = conn.execute(
        "UPDATE linked_children SET state = ?1 WHERE child_path = ?2",
        params![state.to_string(), path],
    )?;
    if changed == 0 {
        return Err(Error::InvalidOperation(format!("{} is not attached", path)));
    }
    Ok(())
}

pub fn remove(conn: &Connection, path: &str) -> Result<()> {
    let changed = conn.execute(
        "DELETE FROM linked_children WHERE child_path = ?1",
        [path],
    )?;
    if changed == 0 {
        return Err(Error::InvalidOperation(format!("{} is not attached", path)));
    }
    Ok(())
}

pub fn find_by_path(conn: &Connection, path: &str) -> Result<Option<ChildRelation>> {
    let mut stmt = conn.prepare(
        "SELECT child_path, name, policy, state FROM linked_children WHERE child_path = ?1",
    )?;
    stmt.query_row([path], from_row)
        .optional()?
        .map(decode)
        .transpose()
}

/// All children ordered by path
pub fn list_all(conn: &Connection) -> Result<Vec<ChildRelation>> {
    let mut stmt = conn.prepare(
        "SELECT child_path, name, policy, state FROM linked_children ORDER BY child_path",
    )?;
    let rows = stmt
        .query_map([], from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;

    fn child(path: &str, policy: LinkPolicy) -> ChildRelation {
        ChildRelation {
            name: format!("zone:{}", path.trim_start_matches('/')),
            path: PathBuf::from(path),
            policy,
            state: ChildState::Attached,
        }
    }

    #[test]
    fn test_insert_and_list() {
        let conn = test_connection();
        insert(&conn, &child("/zones/b", LinkPolicy::Ignore)).unwrap();
        insert(&conn, &child("/zones/a", LinkPolicy::Recurse)).unwrap();

        let all = list_all(&conn).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, PathBuf::from("/zones/a"));
        assert_eq!(all[0].policy, LinkPolicy::Recurse);

        assert!(insert(&conn, &child("/zones/a", LinkPolicy::Recurse)).is_err());
    }

    #[test]
    fn test_update_and_remove() {
        let conn = test_connection();
        insert(&conn, &child("/zones/a", LinkPolicy::Recurse)).unwrap();
        update_state(&conn, "/zones/a", ChildState::Synced).unwrap();
        assert_eq!(
            find_by_path(&conn, "/zones/a").unwrap().unwrap().state,
            ChildState::Synced
        );

        remove(&conn, "/zones/a").unwrap();
        assert!(find_by_path(&conn, "/zones/a").unwrap().is_none());
        assert!(remove(&conn, "/zones/a").is_err());
        assert!(update_state(&conn, "/zones/a", ChildState::Synced).is_err());
    }
}
