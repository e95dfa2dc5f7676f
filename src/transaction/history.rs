// src/transaction/history.rs

//! Operation history read back from archived journals

use super::journal::{JournalRecord, TransactionJournal};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use strum_macros::Display;
use tracing::warn;

/// How an archived transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HistoryOutcome {
    Succeeded,
    Aborted,
    /// Dismissed after a failure the external mechanism repaired
    Repaired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub tx_uuid: String,
    pub started: DateTime<Utc>,
    pub description: String,
    pub outcome: HistoryOutcome,
    pub planned: usize,
    pub applied: usize,
    pub duration_ms: u64,
    /// Root of the parent image when part of a linked operation
    pub linked_parent: Option<PathBuf>,
    /// Last reason recorded by an abort or failure
    pub reason: Option<String>,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<9}  {}  ({}/{} action(s), {}ms)",
            self.started.format("%Y-%m-%d %H:%M:%S"),
            self.outcome,
            self.description,
            self.applied,
            self.planned,
            self.duration_ms
        )?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

impl HistoryEntry {
    fn from_records(tx_uuid: &str, records: &[JournalRecord]) -> Option<Self> {
        let Some(JournalRecord::Begin {
            description,
            timestamp,
            ..
        }) = records.first()
        else {
            return None;
        };

        let mut entry = Self {
            tx_uuid: tx_uuid.to_string(),
            started: *timestamp,
            description: description.clone(),
            outcome: HistoryOutcome::Aborted,
            planned: 0,
            applied: 0,
            duration_ms: 0,
            linked_parent: None,
            reason: None,
        };
        let mut failed = false;
        for record in records {
            match record {
                JournalRecord::Linked { parent, .. } => entry.linked_parent = Some(parent.clone()),
                JournalRecord::Planned { actions, .. } => entry.planned = actions.len(),
                JournalRecord::ActionApplied { .. } => entry.applied += 1,
                JournalRecord::Failed { label, reason, .. } => {
                    failed = true;
                    entry.reason = Some(format!("{}: {}", label, reason));
                }
                JournalRecord::Aborted { reason } if !failed => {
                    entry.reason = Some(reason.clone());
                }
                JournalRecord::Done {
                    duration_ms,
                    success,
                } => {
                    entry.duration_ms = *duration_ms;
                    entry.outcome = match (*success, failed || entry.applied > 0) {
                        (true, _) => HistoryOutcome::Succeeded,
                        (false, true) => HistoryOutcome::Repaired,
                        (false, false) => HistoryOutcome::Aborted,
                    };
                }
                _ => {}
            }
        }
        Some(entry)
    }
}

/// Every archived transaction of the image rooted at `root`, oldest first
///
/// Archived journals that cannot be read are logged and left out.
pub fn history(root: &Path) -> Result<Vec<HistoryEntry>> {
    let archive = crate::paths::journal_archive_dir(root);
    let mut entries = Vec::new();
    if !archive.exists() {
        return Ok(entries);
    }

    for dir_entry in fs::read_dir(&archive)? {
        let path = dir_entry?.path();
        if !path.extension().is_some_and(|e| e == "journal") {
            continue;
        }
        let read = TransactionJournal::open(path.clone()).and_then(|journal| {
            let records = journal.read_all()?;
            Ok(HistoryEntry::from_records(journal.tx_uuid(), &records))
        });
        match read {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => warn!("Skipping {}: no Begin record", path.display()),
            Err(e) => warn!("Skipping {}: {}", path.display(), e),
        }
    }

    entries.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.tx_uuid.cmp(&b.tx_uuid)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageState;
    use crate::paths;
    use chrono::Duration;
    use tempfile::TempDir;

    fn archive(root: &Path, tx_uuid: &str, started: DateTime<Utc>, tail: &[JournalRecord]) {
        let mut journal = TransactionJournal::create(&paths::journal_dir(root), tx_uuid).unwrap();
        journal
            .write_barrier(&JournalRecord::Begin {
                tx_uuid: tx_uuid.to_string(),
                root: root.to_path_buf(),
                description: format!("install {}", tx_uuid),
                timestamp: started,
            })
            .unwrap();
        journal
            .write_barrier(&JournalRecord::Planned {
                actions: vec!["install dir a".to_string(), "install dir b".to_string()],
                target: ImageState::default(),
            })
            .unwrap();
        for record in tail {
            journal.write_barrier(record).unwrap();
        }
        journal.archive().unwrap();
    }

    fn applied(index: usize) -> JournalRecord {
        JournalRecord::ActionApplied {
            index,
            label: format!("action {}", index),
        }
    }

    fn done(success: bool) -> JournalRecord {
        JournalRecord::Done {
            duration_ms: 5,
            success,
        }
    }

    #[test]
    fn test_history_outcomes_in_order() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();

        archive(
            dir.path(),
            "second",
            now,
            &[
                JournalRecord::Aborted {
                    reason: "cancelled before the first action".to_string(),
                },
                done(false),
            ],
        );
        archive(
            dir.path(),
            "first",
            now - Duration::minutes(5),
            &[
                applied(0),
                applied(1),
                JournalRecord::Committed { packages: 1 },
                done(true),
            ],
        );
        archive(
            dir.path(),
            "third",
            now + Duration::minutes(5),
            &[
                applied(0),
                JournalRecord::Failed {
                    index: 1,
                    label: "install dir b".to_string(),
                    reason: "disk full".to_string(),
                },
                JournalRecord::Aborted {
                    reason: "dismissed after external repair".to_string(),
                },
                done(false),
            ],
        );

        let entries = history(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.tx_uuid.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);

        assert_eq!(entries[0].outcome, HistoryOutcome::Succeeded);
        assert_eq!((entries[0].applied, entries[0].planned), (2, 2));
        assert_eq!(entries[1].outcome, HistoryOutcome::Aborted);
        assert_eq!(
            entries[1].reason.as_deref(),
            Some("cancelled before the first action")
        );
        assert_eq!(entries[2].outcome, HistoryOutcome::Repaired);
        assert!(entries[2].reason.as_deref().unwrap().contains("disk full"));
    }

    #[test]
    fn test_history_without_archive() {
        let dir = TempDir::new().unwrap();
        assert!(history(dir.path()).unwrap().is_empty());
    }
}
