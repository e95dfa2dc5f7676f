// src/transaction/journal.rs

//! Append-only transaction journal for crash recovery
//!
//! The journal is the durable record of how far a plan got. Each record is
//! written as a single line with a CRC32 checksum for integrity verification.
//!
//! Format: `{crc32_hex}|{json}\n`
//!
//! Phase barriers and every applied action are fsynced before the engine
//! moves on, so after a crash the journal names exactly the actions that
//! reached the image.

use super::TransactionPhase;
use crate::error::{Error, Result};
use crate::image::ImageState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A record in the transaction journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalRecord {
    /// Transaction started
    Begin {
        tx_uuid: String,
        root: PathBuf,
        description: String,
        timestamp: DateTime<Utc>,
    },

    /// Member of a linked operation; the parent's journal holds the decision
    Linked { parent: PathBuf, members: usize },

    /// Ordered action labels, indexed by the records that follow, and the
    /// state to record once all of them are applied
    Planned {
        actions: Vec<String>,
        target: ImageState,
    },

    /// Content staged; nothing applied yet
    Staged { count: usize },

    /// One action reached the image
    ActionApplied { index: usize, label: String },

    /// An action failed; earlier ones stay applied
    Failed {
        index: usize,
        label: String,
        reason: String,
    },

    /// Every member of a linked operation applied its actions
    CommitDecided { members: usize },

    /// New image state persisted
    Committed { packages: usize },

    /// Stopped before the first action
    Aborted { reason: String },

    /// Transaction complete
    Done { duration_ms: u64, success: bool },
}

impl JournalRecord {
    /// Get the transaction phase this record represents
    pub fn to_phase(&self) -> TransactionPhase {
        match self {
            Self::Begin { .. } | Self::Linked { .. } => TransactionPhase::New,
            Self::Planned { .. } => TransactionPhase::Planned,
            Self::Staged { .. } => TransactionPhase::Staged,
            Self::ActionApplied { .. } | Self::CommitDecided { .. } => TransactionPhase::Applying,
            Self::Failed { .. } => TransactionPhase::Failed,
            Self::Committed { .. } => TransactionPhase::Committed,
            Self::Aborted { .. } => TransactionPhase::Aborted,
            Self::Done { .. } => TransactionPhase::Done,
        }
    }
}

/// Append-only transaction journal with fsync barriers
pub struct TransactionJournal {
    path: PathBuf,
    file: File,
    tx_uuid: String,
    sequence: u64,
}

impl TransactionJournal {
    /// Create a new journal for a transaction
    pub fn create(journal_dir: &Path, tx_uuid: &str) -> Result<Self> {
        fs::create_dir_all(journal_dir)?;

        let path = journal_dir.join(format!("tx-{}.journal", tx_uuid));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            tx_uuid: tx_uuid.to_string(),
            sequence: 0,
        })
    }

    /// Open an existing journal for recovery
    pub fn open(path: PathBuf) -> Result<Self> {
        let tx_uuid = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("tx-"))
            .ok_or_else(|| {
                Error::JournalCorrupted(format!("invalid journal filename {}", path.display()))
            })?
            .to_string();

        let sequence = {
            let file = File::open(&path)?;
            BufReader::new(file).lines().count() as u64
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            file,
            tx_uuid,
            sequence,
        })
    }

    pub fn tx_uuid(&self) -> &str {
        &self.tx_uuid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written (or found, for an opened journal)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Write a record to the journal (does NOT fsync)
    pub fn write(&mut self, record: &JournalRecord) -> Result<()> {
        self.sequence += 1;
        let json = serde_json::to_string(record)?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        Ok(())
    }

    /// Write a record and fsync
    pub fn write_barrier(&mut self, record: &JournalRecord) -> Result<()> {
        self.write(record)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read every record
    ///
    /// A damaged final line is a write torn by a crash and is dropped. Damage
    /// anywhere before it means the applied set cannot be trusted.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let file = File::open(&self.path)?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()?;
        let last = lines.iter().rposition(|l| !l.is_empty());

        let mut records = Vec::with_capacity(lines.len());
        for (line_num, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Ok(record) => records.push(record),
                Err(reason) if Some(line_num) == last => {
                    warn!(
                        "Dropping torn record at line {} of {}: {}",
                        line_num + 1,
                        self.path.display(),
                        reason
                    );
                }
                Err(reason) => {
                    return Err(Error::JournalCorrupted(format!(
                        "{} line {}: {}",
                        self.path.display(),
                        line_num + 1,
                        reason
                    )));
                }
            }
        }

        Ok(records)
    }

    /// Get the last phase reached
    pub fn last_phase(&self) -> Result<TransactionPhase> {
        Ok(self
            .read_all()?
            .last()
            .map(JournalRecord::to_phase)
            .unwrap_or(TransactionPhase::New))
    }

    /// Move the journal into the archive directory
    pub fn archive(self) -> Result<()> {
        let archive_dir = self
            .path
            .parent()
            .unwrap_or(Path::new("."))
            .join("archive");
        fs::create_dir_all(&archive_dir)?;

        let name = format!("tx-{}.journal", self.tx_uuid);
        fs::rename(&self.path, archive_dir.join(name))?;
        Ok(())
    }

    /// Delete the journal
    pub fn delete(self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

fn decode_line(line: &str) -> std::result::Result<JournalRecord, String> {
    let (crc, json) = line
        .split_once('|')
        .ok_or_else(|| "missing delimiter".to_string())?;
    let expected = u32::from_str_radix(crc, 16).map_err(|_| format!("invalid CRC32 '{}'", crc))?;
    let actual = crc32fast::hash(json.as_bytes());
    if expected != actual {
        return Err(format!(
            "CRC mismatch: expected {:08x}, got {:08x}",
            expected, actual
        ));
    }
    serde_json::from_str(json).map_err(|e| format!("unreadable record: {}", e))
}

/// Find incomplete transaction journals in a directory, oldest name first
pub fn find_incomplete_journals(journal_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut journals = Vec::new();

    if !journal_dir.exists() {
        return Ok(journals);
    }

    for entry in fs::read_dir(journal_dir)? {
        let path = entry?.path();

        // archive/ is a directory and never matches
        if path.is_file()
            && path.extension().is_some_and(|e| e == "journal")
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("tx-"))
        {
            let journal = TransactionJournal::open(path.clone())?;
            let records = journal.read_all()?;

            let has_done = records
                .iter()
                .any(|r| matches!(r, JournalRecord::Done { .. }));

            if !has_done {
                journals.push(path);
            }
        }
    }

    journals.sort();
    Ok(journals)
}
