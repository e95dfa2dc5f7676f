// src/transaction/mod.rs

//! Plan execution with a durable journal
//!
//! Executing an [`ImagePlan`] walks its ordered actions through an external
//! [`ActionExecutor`]. The journal records each phase:
//!
//! ```text
//! Begin -> Planned -> Staged -> Applying -> Committed -> Done
//!                       |           |
//!                    Aborted      Failed
//! ```
//!
//! `Staged` is the abort-before-commit boundary: everything is prepared and
//! nothing has touched the image. Cancellation is honored up to that point
//! and ignored once the first action is applied. After a failure or a crash
//! the journal names exactly which actions were applied so an external
//! recovery mechanism can finish or undo them.
//!
//! A new transaction is refused while any earlier journal of the image is
//! incomplete. Linked operations drive the phases of each member separately
//! through [`StagedTransaction`].

mod history;
pub mod journal;
mod recovery;

pub use history::{HistoryEntry, HistoryOutcome, history};
pub use journal::{JournalRecord, TransactionJournal, find_incomplete_journals};
pub use recovery::{JournalSummary, RecoveryOutcome, dismiss, recover_all, recover_all_with, scan};

use crate::error::{Error, Result};
use crate::image::Image;
use crate::paths;
use crate::plan::{ImagePlan, PlanState, PlannedAction};
use crate::progress::{CancelToken, ProgressTracker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum_macros::Display;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Transaction phases as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum TransactionPhase {
    /// Journal created, nothing recorded beyond the description
    New,
    /// Ordered action list recorded
    Planned,
    /// Ready to apply; last point where the transaction can be dropped cleanly
    Staged,
    /// At least one action applied
    Applying,
    /// New image state persisted
    Committed,
    Done,
    Aborted,
    Failed,
}

impl TransactionPhase {
    /// True while nothing has been applied to the image
    pub fn is_before_apply(&self) -> bool {
        matches!(self, Self::New | Self::Planned | Self::Staged | Self::Aborted)
    }
}

/// Applies one planned action to the real filesystem or service layer
///
/// Implementations live outside the engine.
pub trait ActionExecutor {
    fn apply(&mut self, action: &PlannedAction) -> Result<()>;
}

/// Executor for images whose content is managed elsewhere
///
/// Records each action in the log and changes nothing on disk, so only the
/// package database moves.
#[derive(Debug, Default)]
pub struct MetadataOnly {
    applied: usize,
}

impl MetadataOnly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }
}

impl ActionExecutor for MetadataOnly {
    fn apply(&mut self, action: &PlannedAction) -> Result<()> {
        debug!("Recording {}", action);
        self.applied += 1;
        Ok(())
    }
}

/// Options for controlling transaction execution
#[derive(Default, Clone)]
pub struct TransactionOptions {
    /// Honored only until the first action is applied
    pub cancel: Option<CancelToken>,
    /// Progress tracker for reporting operation progress
    pub progress: Option<Arc<dyn ProgressTracker>>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// Result of a completed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub tx_uuid: String,
    pub applied: usize,
    pub duration_ms: u64,
}

/// Executes prepared plans against one image
pub struct Transaction<'a> {
    image: &'a mut Image,
    options: TransactionOptions,
}

impl<'a> Transaction<'a> {
    /// The caller is expected to hold the image's exclusive lock
    pub fn new(image: &'a mut Image, options: TransactionOptions) -> Self {
        Self { image, options }
    }

    /// Apply every action of a prepared plan, then persist the target state
    ///
    /// On failure the error carries how many actions completed and the
    /// journal is left in place for [`recover_all`].
    pub fn execute(
        &mut self,
        plan: &mut ImagePlan,
        executor: &mut dyn ActionExecutor,
    ) -> Result<TransactionResult> {
        let mut staged = self.stage(plan)?;

        if self.options.is_cancelled() {
            let tx_uuid = staged.tx_uuid().to_string();
            staged.abort(plan, "cancelled before the first action")?;
            info!("Transaction {} cancelled before any action was applied", tx_uuid);
            return Err(Error::Cancelled("plan execution".to_string()));
        }

        staged.apply(plan, executor)?;
        staged.commit(self.image, plan)
    }

    /// Journal a prepared plan up to the `Staged` boundary
    ///
    /// Refused while an earlier transaction of the image awaits recovery.
    pub fn stage(&self, plan: &ImagePlan) -> Result<StagedTransaction> {
        self.stage_with(plan, Uuid::new_v4().to_string(), None)
    }

    /// Stage one member of a linked operation
    ///
    /// Every member shares `tx_uuid`; the journal of the image rooted at
    /// `parent` carries the commit decision.
    pub(crate) fn stage_linked(
        &self,
        plan: &ImagePlan,
        tx_uuid: &str,
        parent: &Path,
        members: usize,
    ) -> Result<StagedTransaction> {
        self.stage_with(plan, tx_uuid.to_string(), Some((parent, members)))
    }

    fn stage_with(
        &self,
        plan: &ImagePlan,
        tx_uuid: String,
        linked: Option<(&Path, usize)>,
    ) -> Result<StagedTransaction> {
        if plan.state() != PlanState::Prepared {
            return Err(Error::InvalidPlanState {
                expected: PlanState::Prepared.to_string(),
                found: plan.state().to_string(),
            });
        }

        let root = self.image.root().to_path_buf();
        ensure_no_pending(&root)?;

        let start = Utc::now();
        let mut journal = TransactionJournal::create(&paths::journal_dir(&root), &tx_uuid)?;
        let description = plan.summary().to_string();

        info!("Beginning transaction {}: {}", tx_uuid, description);
        journal.write_barrier(&JournalRecord::Begin {
            tx_uuid: tx_uuid.clone(),
            root: root.clone(),
            description,
            timestamp: start,
        })?;
        if let Some((parent, members)) = linked {
            journal.write_barrier(&JournalRecord::Linked {
                parent: parent.to_path_buf(),
                members,
            })?;
        }

        let labels: Vec<String> = plan.actions().iter().map(PlannedAction::label).collect();
        journal.write_barrier(&JournalRecord::Planned {
            actions: labels.clone(),
            target: plan.target_state().clone(),
        })?;
        journal.write_barrier(&JournalRecord::Staged {
            count: labels.len(),
        })?;

        Ok(StagedTransaction {
            tx_uuid,
            root,
            journal,
            labels,
            start,
            phase: TransactionPhase::Staged,
            progress: self.options.progress.clone(),
        })
    }
}

/// A transaction journaled up to `Staged`
///
/// Moves forward through [`apply`](Self::apply) and
/// [`commit`](Self::commit), or is dropped cleanly with
/// [`abort`](Self::abort) before anything is applied.
pub struct StagedTransaction {
    tx_uuid: String,
    root: PathBuf,
    journal: TransactionJournal,
    labels: Vec<String>,
    start: DateTime<Utc>,
    phase: TransactionPhase,
    progress: Option<Arc<dyn ProgressTracker>>,
}

impl StagedTransaction {
    pub fn tx_uuid(&self) -> &str {
        &self.tx_uuid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn expect_phase(&self, expected: TransactionPhase) -> Result<()> {
        if self.phase != expected {
            return Err(Error::InvalidOperation(format!(
                "transaction {} is {}, expected {}",
                self.tx_uuid, self.phase, expected
            )));
        }
        Ok(())
    }

    /// Apply the staged actions in order, journaling each one
    pub fn apply(&mut self, plan: &ImagePlan, executor: &mut dyn ActionExecutor) -> Result<()> {
        self.expect_phase(TransactionPhase::Staged)?;
        if plan.actions().len() != self.labels.len() {
            return Err(Error::InvalidOperation(format!(
                "transaction {} staged {} action(s), plan has {}",
                self.tx_uuid,
                self.labels.len(),
                plan.actions().len()
            )));
        }

        if let Some(progress) = &self.progress {
            progress.set_length(self.labels.len() as u64);
            progress.set_message("Applying actions");
        }

        for (index, action) in plan.actions().iter().enumerate() {
            let label = &self.labels[index];
            if let Err(e) = executor.apply(action) {
                let reason = e.to_string();
                warn!(
                    "Action {} ({}) failed after {} applied: {}",
                    index, label, index, reason
                );
                self.phase = TransactionPhase::Failed;
                self.journal.write_barrier(&JournalRecord::Failed {
                    index,
                    label: label.clone(),
                    reason: reason.clone(),
                })?;
                if let Some(progress) = &self.progress {
                    progress.finish_with_error(&reason);
                }
                return Err(Error::ExecutionFailed {
                    completed: index,
                    failed: label.clone(),
                    reason,
                });
            }
            self.journal.write_barrier(&JournalRecord::ActionApplied {
                index,
                label: label.clone(),
            })?;
            debug!("Applied {}", action);
            if let Some(progress) = &self.progress {
                progress.increment(1);
            }
        }

        self.phase = TransactionPhase::Applying;
        Ok(())
    }

    /// Record that every member of a linked operation has applied
    pub(crate) fn decide(&mut self, members: usize) -> Result<()> {
        self.expect_phase(TransactionPhase::Applying)?;
        self.journal
            .write_barrier(&JournalRecord::CommitDecided { members })?;
        debug!("Transaction {} decided to commit {} image(s)", self.tx_uuid, members);
        Ok(())
    }

    /// Persist the target state and archive the journal
    pub fn commit(mut self, image: &mut Image, plan: &mut ImagePlan) -> Result<TransactionResult> {
        self.expect_phase(TransactionPhase::Applying)?;
        if image.root() != self.root.as_path() {
            return Err(Error::InvalidOperation(format!(
                "transaction {} belongs to {}, not {}",
                self.tx_uuid,
                self.root.display(),
                image.root().display()
            )));
        }

        let target = plan.target_state();
        image.save_state(target)?;
        self.journal.write_barrier(&JournalRecord::Committed {
            packages: target.installed.len(),
        })?;
        plan.mark_executed()?;

        let duration_ms = elapsed_ms(self.start);
        self.journal.write_barrier(&JournalRecord::Done {
            duration_ms,
            success: true,
        })?;
        self.journal.archive()?;

        if let Some(progress) = &self.progress {
            progress.finish_with_message("done");
        }
        info!(
            "Transaction {} complete: {} action(s) in {}ms",
            self.tx_uuid,
            self.labels.len(),
            duration_ms
        );

        Ok(TransactionResult {
            tx_uuid: self.tx_uuid,
            applied: self.labels.len(),
            duration_ms,
        })
    }

    /// Drop a transaction that has not applied anything
    pub fn abort(mut self, plan: &mut ImagePlan, reason: &str) -> Result<()> {
        self.expect_phase(TransactionPhase::Staged)?;
        self.journal.write_barrier(&JournalRecord::Aborted {
            reason: reason.to_string(),
        })?;
        self.journal.write_barrier(&JournalRecord::Done {
            duration_ms: elapsed_ms(self.start),
            success: false,
        })?;
        self.journal.archive()?;
        plan.abort()?;
        debug!("Transaction {} aborted: {}", self.tx_uuid, reason);
        Ok(())
    }
}

/// Refuse to start while an earlier transaction of the image awaits recovery
pub fn ensure_no_pending(root: &Path) -> Result<()> {
    let pending = find_incomplete_journals(&paths::journal_dir(root))?;
    if !pending.is_empty() {
        return Err(Error::InvalidOperation(format!(
            "{} has {} incomplete transaction(s); run recover first",
            root.display(),
            pending.len()
        )));
    }
    Ok(())
}

pub(crate) fn elapsed_ms(start: chrono::DateTime<Utc>) -> u64 {
    Utc::now()
        .signed_duration_since(start)
        .num_milliseconds()
        .max(0) as u64
}
