// src/progress.rs

//! Operation feedback and control
//!
//! [`ProgressTracker`] receives updates while a plan executes; [`CancelToken`]
//! lets the caller stop a solve, a plan computation, or an execution that has
//! not yet applied its first action. [`CliProgress`] draws a bar on a
//! terminal, [`LogProgress`] reports through `tracing` everywhere else.
//!
//! # Example
//!
//! ```ignore
//! let cancel = CancelToken::new();
//! let progress = LogProgress::new("Executing plan", plan.actions().len() as u64);
//! Transaction::new(&image, options.with_cancel(cancel.clone()).with_progress(progress));
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::info;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress reporting interface
///
/// Implementations must be thread-safe (Send + Sync).
pub trait ProgressTracker: Send + Sync {
    /// Set the current status message
    fn set_message(&self, message: &str);

    /// Increment progress by the given amount
    fn increment(&self, amount: u64);

    /// Set the total (length) of the progress
    fn set_length(&self, length: u64);

    fn position(&self) -> u64;

    fn length(&self) -> u64;

    /// Finish progress successfully with a message
    fn finish_with_message(&self, message: &str);

    /// Finish progress with an error/abandonment message
    fn finish_with_error(&self, message: &str);

    fn is_finished(&self) -> bool;
}

/// No-op tracker for quiet or scripted use
#[derive(Debug, Default)]
pub struct SilentProgress {
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}

    fn increment(&self, amount: u64) {
        self.position.fetch_add(amount, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Tracker that reports through `tracing` at roughly every tenth of the work
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl LogProgress {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            position: AtomicU64::new(0),
            length: AtomicU64::new(length),
            finished: AtomicBool::new(false),
        }
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn increment(&self, amount: u64) {
        let old_pos = self.position.fetch_add(amount, Ordering::Relaxed);
        let new_pos = old_pos + amount;
        let length = self.length.load(Ordering::Relaxed);
        let interval = std::cmp::max(1, length / 10);

        if length > 0 && new_pos / interval > old_pos / interval {
            info!(
                "{}: {}% ({}/{})",
                self.name,
                (new_pos * 100) / length,
                new_pos,
                length
            );
        }
    }

    fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: {}", self.name, message);
    }

    fn finish_with_error(&self, message: &str) {
        self.finished.store(true, Ordering::Relaxed);
        info!("{}: ERROR - {}", self.name, message);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

/// Progress bar on stderr
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub fn new(name: &str, length: u64) -> Self {
        Self::with_bar(ProgressBar::new(length), name)
    }

    /// Bar that draws nothing, for scripted callers
    pub fn hidden(name: &str, length: u64) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(length);
        Self::with_bar(bar, name)
    }

    fn with_bar(bar: ProgressBar, name: &str) -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix} ({pos}/{len}) [{bar:40.green/dim}] {percent}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        bar.set_style(style);
        bar.set_prefix(name.to_string());
        Self { bar }
    }
}

impl ProgressTracker for CliProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn set_length(&self, length: u64) {
        self.bar.set_length(length);
    }

    fn position(&self) -> u64 {
        self.bar.position()
    }

    fn length(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    fn finish_with_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("FAILED: {}", message));
    }

    fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

/// A bar when stderr is a terminal, log lines otherwise
pub fn for_terminal(name: &str, length: u64) -> Arc<dyn ProgressTracker> {
    if std::io::stderr().is_terminal() {
        Arc::new(CliProgress::new(name, length))
    } else {
        Arc::new(LogProgress::new(name, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_silent_progress() {
        let progress = SilentProgress::new();
        progress.set_length(4);
        progress.increment(3);
        assert_eq!(progress.position(), 3);
        assert_eq!(progress.length(), 4);
        assert!(!progress.is_finished());
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_log_progress() {
        let progress = LogProgress::new("apply", 10);
        for _ in 0..10 {
            progress.increment(1);
        }
        assert_eq!(progress.position(), 10);
        progress.finish_with_error("boom");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_cli_progress_tracks_bar() {
        let progress = CliProgress::hidden("apply", 2);
        progress.set_length(3);
        progress.increment(2);
        assert_eq!((progress.position(), progress.length()), (2, 3));
        assert!(!progress.is_finished());
        progress.finish_with_error("disk full");
        assert!(progress.is_finished());
    }
}
