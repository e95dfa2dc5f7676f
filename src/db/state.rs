// src/db/state.rs

//! Persistence of the installed set and image configuration

use crate::error::Result;
use crate::fmri::{Fmri, Version};
use crate::image::{Freeze, ImageConfig, ImageState, MediatorSetting};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use tracing::debug;

/// Replace the stored state with `state`
///
/// All tables are rewritten inside one SQL transaction; a crash leaves either
/// the previous state or the new one.
pub fn save(conn: &mut Connection, state: &ImageState) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "
        DELETE FROM installed;
        DELETE FROM variants;
        DELETE FROM facets;
        DELETE FROM mediators;
        DELETE FROM publishers;
        DELETE FROM freezes;
        DELETE FROM avoid_list;
        ",
    )?;

    {
        let mut stmt = tx.prepare("INSERT INTO installed (name, fmri) VALUES (?1, ?2)")?;
        for (name, fmri) in &state.installed {
            stmt.execute(params![name, fmri.to_string()])?;
        }

        let config = &state.config;
        let mut stmt = tx.prepare("INSERT INTO variants (name, value) VALUES (?1, ?2)")?;
        for (name, value) in &config.variants {
            stmt.execute(params![name, value])?;
        }

        let mut stmt = tx.prepare("INSERT INTO facets (name, enabled) VALUES (?1, ?2)")?;
        for (name, enabled) in &config.facets {
            stmt.execute(params![name, *enabled as i32])?;
        }

        let mut stmt = tx.prepare(
            "INSERT INTO mediators (name, version, implementation) VALUES (?1, ?2, ?3)",
        )?;
        for (name, setting) in &config.mediators {
            stmt.execute(params![
                name,
                setting.version.as_ref().map(|v| v.to_string()),
                setting.implementation
            ])?;
        }

        let mut stmt = tx.prepare("INSERT INTO publishers (position, name) VALUES (?1, ?2)")?;
        for (position, name) in config.publishers.iter().enumerate() {
            stmt.execute(params![position as i64, name])?;
        }

        let mut stmt = tx.prepare(
            "INSERT INTO freezes (name, version, reason, frozen_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (name, freeze) in &config.freezes {
            stmt.execute(params![
                name,
                freeze.version.to_string(),
                freeze.reason,
                freeze
                    .frozen_at
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ])?;
        }

        let mut stmt = tx.prepare("INSERT INTO avoid_list (name) VALUES (?1)")?;
        for name in &config.avoid {
            stmt.execute([name])?;
        }
    }

    tx.commit()?;
    debug!(
        "Saved image state: {} installed packages",
        state.installed.len()
    );
    Ok(())
}

/// Load the stored state
pub fn load(conn: &Connection) -> Result<ImageState> {
    let mut installed = BTreeMap::new();
    let mut stmt = conn.prepare("SELECT name, fmri FROM installed ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (name, fmri) in rows {
        installed.insert(name, Fmri::parse(&fmri)?);
    }

    let mut config = ImageConfig::default();

    let mut stmt = conn.prepare("SELECT name, value FROM variants ORDER BY name")?;
    config.variants = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt = conn.prepare("SELECT name, enabled FROM facets ORDER BY name")?;
    config.facets = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i32>(1)? != 0)))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt =
        conn.prepare("SELECT name, version, implementation FROM mediators ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (name, version, implementation) in rows {
        config.mediators.insert(
            name,
            MediatorSetting {
                version: version.as_deref().map(Version::parse).transpose()?,
                implementation,
            },
        );
    }

    let mut stmt = conn.prepare("SELECT name FROM publishers ORDER BY position")?;
    config.publishers = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut stmt =
        conn.prepare("SELECT name, version, reason, frozen_at FROM freezes ORDER BY name")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (name, version, reason, frozen_at) in rows {
        let frozen_at = DateTime::parse_from_rfc3339(&frozen_at)
            .map_err(|e| {
                crate::error::Error::InvalidOperation(format!(
                    "bad freeze timestamp for {}: {}",
                    name, e
                ))
            })?
            .with_timezone(&Utc);
        config.freezes.insert(
            name,
            Freeze {
                version: Version::parse(&version)?,
                reason,
                frozen_at,
            },
        );
    }

    let mut stmt = conn.prepare("SELECT name FROM avoid_list ORDER BY name")?;
    config.avoid = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<_, _>>()?;

    Ok(ImageState { installed, config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;
    use crate::fmri::PackageSpec;

    fn sample_state() -> ImageState {
        let mut state = ImageState::default();
        for f in ["pkg://test/a@1.0", "pkg://test/b@2.0,5.11-0.1:20240101T000000Z"] {
            let fmri = Fmri::parse(f).unwrap();
            state.installed.insert(fmri.name.clone(), fmri);
        }
        let config = &mut state.config;
        config.set_variant("variant.arch", "i386").unwrap();
        config.set_facet("facet.doc.*", Some(false)).unwrap();
        config
            .set_mediator(
                "python",
                MediatorSetting {
                    version: Some(Version::parse("3.11").unwrap()),
                    implementation: Some("cpython".to_string()),
                },
            )
            .unwrap();
        config
            .set_publishers(vec!["test".to_string(), "extra".to_string()])
            .unwrap();
        let b = state.installed["b"].clone();
        state
            .config
            .freeze(&PackageSpec::name("b"), Some(&b), Some("hold"))
            .unwrap();
        state.config.avoid("c");
        state
    }

    #[test]
    fn test_round_trip() {
        let mut conn = test_connection();
        let state = sample_state();
        save(&mut conn, &state).unwrap();
        let loaded = load(&conn).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_replaces() {
        let mut conn = test_connection();
        save(&mut conn, &sample_state()).unwrap();
        save(&mut conn, &ImageState::default()).unwrap();
        assert_eq!(load(&conn).unwrap(), ImageState::default());
    }
}
