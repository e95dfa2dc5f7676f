// src/transaction/recovery.rs

//! Transaction recovery after a crash or failed execution
//!
//! The engine cannot undo filesystem actions itself. What it can do:
//!
//! - Nothing applied: archive the journal, the image is untouched
//! - Every action applied: persist the recorded target state (roll forward)
//! - Partially applied: report the applied indices and leave the journal for
//!   the external recovery mechanism, which finishes or undoes the work and
//!   then dismisses the journal
//!
//! A fully applied member of a linked operation rolls forward only once the
//! parent's journal, active or archived, records the commit decision.

use super::journal::{JournalRecord, TransactionJournal, find_incomplete_journals};
use super::{TransactionPhase, elapsed_ms};
use crate::error::{Error, Result};
use crate::image::{Image, ImageState};
use crate::paths;
use crate::progress::{ProgressTracker, SilentProgress};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What an incomplete journal says about its transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSummary {
    pub tx_uuid: String,
    pub path: PathBuf,
    pub description: String,
    pub phase: TransactionPhase,
    /// Action labels in execution order
    pub planned: Vec<String>,
    /// Indices into `planned` that reached the image, ascending
    pub applied: Vec<usize>,
    pub failure: Option<String>,
    pub target: Option<ImageState>,
    /// Root of the parent image when this was a linked operation member
    pub linked_parent: Option<PathBuf>,
    /// This journal records the commit decision of a linked operation
    pub decided: bool,
}

impl JournalSummary {
    fn from_records(path: PathBuf, tx_uuid: String, records: &[JournalRecord]) -> Result<Self> {
        let Some(JournalRecord::Begin { description, .. }) = records.first() else {
            return Err(Error::JournalCorrupted(format!(
                "{} does not start with a Begin record",
                path.display()
            )));
        };

        let mut summary = Self {
            tx_uuid,
            description: description.clone(),
            phase: TransactionPhase::New,
            planned: Vec::new(),
            applied: Vec::new(),
            failure: None,
            target: None,
            linked_parent: None,
            decided: false,
            path,
        };

        for record in records {
            summary.phase = record.to_phase();
            match record {
                JournalRecord::Planned { actions, target } => {
                    summary.planned = actions.clone();
                    summary.target = Some(target.clone());
                }
                JournalRecord::ActionApplied { index, .. } => {
                    if *index >= summary.planned.len() {
                        return Err(Error::JournalCorrupted(format!(
                            "{} records action {} of {}",
                            summary.path.display(),
                            index,
                            summary.planned.len()
                        )));
                    }
                    summary.applied.push(*index);
                }
                JournalRecord::Failed { label, reason, .. } => {
                    summary.failure = Some(format!("{}: {}", label, reason));
                }
                JournalRecord::Linked { parent, .. } => {
                    summary.linked_parent = Some(parent.clone());
                }
                JournalRecord::CommitDecided { .. } => summary.decided = true,
                _ => {}
            }
        }

        summary.applied.sort_unstable();
        summary.applied.dedup();
        Ok(summary)
    }

    /// Labels of the actions that were not applied
    pub fn pending(&self) -> Vec<&str> {
        self.planned
            .iter()
            .enumerate()
            .filter(|(i, _)| self.applied.binary_search(i).is_err())
            .map(|(_, label)| label.as_str())
            .collect()
    }

    pub fn fully_applied(&self) -> bool {
        self.target.is_some() && self.applied.len() == self.planned.len()
    }

    /// Whether this transaction may be rolled forward once fully applied
    pub fn commit_decided(&self) -> bool {
        let Some(parent) = &self.linked_parent else {
            return true;
        };
        if self.decided {
            return true;
        }
        let name = format!("tx-{}.journal", self.tx_uuid);
        [
            paths::journal_dir(parent).join(&name),
            paths::journal_archive_dir(parent).join(&name),
        ]
        .into_iter()
        .filter(|path| path.exists())
        .any(|path| {
            TransactionJournal::open(path)
                .and_then(|journal| journal.read_all())
                .is_ok_and(|records| {
                    records
                        .iter()
                        .any(|r| matches!(r, JournalRecord::CommitDecided { .. }))
                })
        })
    }
}

/// Summarize every incomplete journal in `journal_dir`
///
/// Damage before the last record of any journal is `JournalCorrupted`.
pub fn scan(journal_dir: &Path) -> Result<Vec<JournalSummary>> {
    let mut summaries = Vec::new();
    for path in find_incomplete_journals(journal_dir)? {
        let journal = TransactionJournal::open(path.clone())?;
        let records = journal.read_all()?;
        summaries.push(JournalSummary::from_records(
            path,
            journal.tx_uuid().to_string(),
            &records,
        )?);
    }
    Ok(summaries)
}

/// Outcome of recovering a transaction
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// Stopped before any action was applied; journal archived
    Clean { tx_uuid: String },
    /// Every action had been applied; the target state is now recorded
    RolledForward { tx_uuid: String },
    /// Some actions applied; left for the external recovery mechanism
    NeedsRepair(JournalSummary),
    /// Journal unreadable, manual intervention needed
    Corrupted { tx_uuid: String, error: String },
}

/// Recover all incomplete transactions of an image
///
/// The caller must hold the image's exclusive lock.
pub fn recover_all(image: &mut Image) -> Result<Vec<RecoveryOutcome>> {
    recover_all_with(image, &SilentProgress::new())
}

/// [`recover_all`], advancing `progress` once per journal
pub fn recover_all_with(
    image: &mut Image,
    progress: &dyn ProgressTracker,
) -> Result<Vec<RecoveryOutcome>> {
    let journal_dir = paths::journal_dir(image.root());
    let journals = find_incomplete_journals(&journal_dir).or_else(|e| match e {
        Error::JournalCorrupted(_) => list_journals(&journal_dir),
        other => Err(other),
    })?;
    progress.set_length(journals.len() as u64);

    let mut outcomes = Vec::new();
    for path in journals {
        if let Some(name) = path.file_name() {
            progress.set_message(&name.to_string_lossy());
        }
        outcomes.push(recover_single(image, path)?);
        progress.increment(1);
    }
    progress.finish_with_message("done");

    Ok(outcomes)
}

fn list_journals(journal_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(journal_dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "journal") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn recover_single(image: &mut Image, path: PathBuf) -> Result<RecoveryOutcome> {
    let fallback = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let mut journal = match TransactionJournal::open(path.clone()) {
        Ok(j) => j,
        Err(e) => {
            return Ok(RecoveryOutcome::Corrupted {
                tx_uuid: fallback,
                error: e.to_string(),
            });
        }
    };
    let tx_uuid = journal.tx_uuid().to_string();

    let records = match journal.read_all() {
        Ok(r) => r,
        Err(e) => {
            warn!("Journal for {} is corrupted: {}", tx_uuid, e);
            return Ok(RecoveryOutcome::Corrupted {
                tx_uuid,
                error: e.to_string(),
            });
        }
    };
    if records
        .iter()
        .any(|r| matches!(r, JournalRecord::Done { .. }))
    {
        journal.archive()?;
        return Ok(RecoveryOutcome::Clean { tx_uuid });
    }
    if records.is_empty() {
        journal.delete()?;
        return Ok(RecoveryOutcome::Clean { tx_uuid });
    }

    let summary = match JournalSummary::from_records(path, tx_uuid.clone(), &records) {
        Ok(s) => s,
        Err(e) => {
            return Ok(RecoveryOutcome::Corrupted {
                tx_uuid,
                error: e.to_string(),
            });
        }
    };
    info!(
        "Recovering transaction {} (last phase: {}, {} of {} applied)",
        tx_uuid,
        summary.phase,
        summary.applied.len(),
        summary.planned.len()
    );

    if summary.phase == TransactionPhase::Committed {
        finish(&mut journal, true)?;
        journal.archive()?;
        return Ok(RecoveryOutcome::RolledForward { tx_uuid });
    }

    if summary.applied.is_empty() && summary.phase.is_before_apply() {
        journal.write_barrier(&JournalRecord::Aborted {
            reason: "recovered before the first action".to_string(),
        })?;
        finish(&mut journal, false)?;
        journal.archive()?;
        return Ok(RecoveryOutcome::Clean { tx_uuid });
    }

    if summary.fully_applied() && !summary.commit_decided() {
        warn!(
            "Transaction {} applied every action but its linked operation never decided to commit",
            tx_uuid
        );
        return Ok(RecoveryOutcome::NeedsRepair(summary));
    }

    if summary.fully_applied()
        && let Some(target) = &summary.target
    {
        image.save_state(target)?;
        journal.write_barrier(&JournalRecord::Committed {
            packages: target.installed.len(),
        })?;
        finish(&mut journal, true)?;
        journal.archive()?;
        info!("Rolled transaction {} forward", tx_uuid);
        return Ok(RecoveryOutcome::RolledForward { tx_uuid });
    }

    warn!(
        "Transaction {} applied {} of {} action(s); external repair required",
        tx_uuid,
        summary.applied.len(),
        summary.planned.len()
    );
    Ok(RecoveryOutcome::NeedsRepair(summary))
}

fn finish(journal: &mut TransactionJournal, success: bool) -> Result<()> {
    let started = match journal.read_all()?.first() {
        Some(JournalRecord::Begin { timestamp, .. }) => *timestamp,
        _ => Utc::now(),
    };
    journal.write_barrier(&JournalRecord::Done {
        duration_ms: elapsed_ms(started),
        success,
    })
}

/// Archive the journal of a transaction the external mechanism has repaired
pub fn dismiss(journal_dir: &Path, tx_uuid: &str) -> Result<()> {
    let path = journal_dir.join(format!("tx-{}.journal", tx_uuid));
    if !path.exists() {
        return Err(Error::InvalidOperation(format!(
            "no incomplete transaction {}",
            tx_uuid
        )));
    }
    let mut journal = TransactionJournal::open(path)?;
    journal.write_barrier(&JournalRecord::Aborted {
        reason: "dismissed after external repair".to_string(),
    })?;
    finish(&mut journal, false)?;
    journal.archive()?;
    info!("Dismissed transaction {}", tx_uuid);
    Ok(())
}
