// src/image/mod.rs

//! Image state and on-disk images
//!
//! An image is a root directory whose metadata lives under `var/pkg/`. Its
//! state is the installed set (one FMRI per package name) plus the image
//! configuration. Operations work on an immutable [`ImageState`] snapshot and
//! persist a complete new state once execution succeeds.

mod config;
mod lock;

pub use config::{Freeze, ImageConfig, MediatorSetting};
pub use lock::{ImageLock, LockMode};

use crate::db;
use crate::error::Result;
use crate::fmri::Fmri;
use crate::linked::{ChildRelation, ChildState};
use crate::paths;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Installed packages and configuration of one image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageState {
    /// Package name → installed FMRI
    pub installed: BTreeMap<String, Fmri>,
    pub config: ImageConfig,
}

impl ImageState {
    pub fn installed(&self, name: &str) -> Option<&Fmri> {
        self.installed.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    /// Record `fmri` as the installed version of its package
    pub fn install(&mut self, fmri: Fmri) {
        self.installed.insert(fmri.name.clone(), fmri);
    }

    pub fn uninstall(&mut self, name: &str) -> Option<Fmri> {
        self.installed.remove(name)
    }
}

/// An image on disk
pub struct Image {
    root: PathBuf,
    conn: Connection,
}

impl Image {
    /// Create the metadata directory and database for a new image
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(paths::journal_dir(&root))?;
        let conn = db::init(&paths::db_path(&root))?;
        info!("Created image at {}", root.display());
        Ok(Self { root, conn })
    }

    /// Open an existing image
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let conn = db::open(&paths::db_path(&root))?;
        Ok(Self { root, conn })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn load_state(&self) -> Result<ImageState> {
        db::state::load(&self.conn)
    }

    /// Atomically replace the persisted state
    pub fn save_state(&mut self, state: &ImageState) -> Result<()> {
        db::state::save(&mut self.conn, state)
    }

    /// Take the exclusive mutation lock
    pub fn lock_exclusive(&self, retries: u32) -> Result<ImageLock> {
        ImageLock::exclusive(paths::lock_path(&self.root), retries)
    }

    /// Take a shared lock for read-only queries
    pub fn lock_shared(&self, retries: u32) -> Result<ImageLock> {
        ImageLock::shared(paths::lock_path(&self.root), retries)
    }

    /// Linked children recorded in this image, ordered by path
    pub fn children(&self) -> Result<Vec<ChildRelation>> {
        db::relations::list_all(&self.conn)
    }

    pub fn attach_child(&self, child: &ChildRelation) -> Result<()> {
        info!(
            "Attaching child image {} ({})",
            child.path.display(),
            child.policy
        );
        db::relations::insert(&self.conn, child)
    }

    pub fn detach_child(&self, path: &Path) -> Result<()> {
        db::relations::remove(&self.conn, &path.display().to_string())
    }

    pub fn set_child_state(&self, path: &Path, state: ChildState) -> Result<()> {
        db::relations::update_state(&self.conn, &path.display().to_string(), state)
    }
}
