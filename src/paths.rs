// src/paths.rs
//! Centralized path derivation for image metadata

use std::path::{Path, PathBuf};

/// Metadata directory of an image rooted at `root`
pub fn meta_dir(root: &Path) -> PathBuf {
    root.join("var").join("pkg")
}

/// SQLite database holding the installed set and configuration
pub fn db_path(root: &Path) -> PathBuf {
    meta_dir(root).join("image.db")
}

/// Advisory lock file for the per-image mutation lock
pub fn lock_path(root: &Path) -> PathBuf {
    meta_dir(root).join("lock")
}

/// Directory of transaction journals
pub fn journal_dir(root: &Path) -> PathBuf {
    meta_dir(root).join("journal")
}

/// Directory of completed journals kept for audit
pub fn journal_archive_dir(root: &Path) -> PathBuf {
    journal_dir(root).join("archive")
}

/// Engine configuration file
pub fn config_path(root: &Path) -> PathBuf {
    std::env::var("IMAGEPKG_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| meta_dir(root).join("engine.toml"))
}
