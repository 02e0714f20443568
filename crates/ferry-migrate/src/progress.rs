//! Progress tracking for migration runs.

use crate::types::{EntityStatus, Stage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Progress update information.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Entity the update is about.
    pub entity_id: String,

    /// Stage the entity just entered.
    pub stage: Stage,

    /// Entities finished so far in this run.
    pub completed: u64,

    /// Entities in this run.
    pub total: u64,

    /// Optional message.
    pub message: Option<String>,
}

/// Progress tracker shared by every entity of a run.
pub struct MigrationProgress {
    completed: AtomicU64,
    total: AtomicU64,
    callback: Option<Arc<ProgressCallback>>,
}

impl MigrationProgress {
    /// Create a new progress tracker.
    pub fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            callback: None,
        }
    }

    /// Create a progress tracker with a callback.
    pub fn with_callback(callback: ProgressCallback) -> Self {
        Self {
            completed: AtomicU64::new(0),
            total: AtomicU64::new(0),
            callback: Some(Arc::new(callback)),
        }
    }

    /// Reset the counters for a run of `total` entities.
    pub fn set_total(&self, total: u64) {
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    /// An entity entered `stage`.
    pub fn stage(&self, entity_id: &str, stage: Stage) {
        self.notify(entity_id, stage, None);
    }

    /// An entity reached a final status.
    pub fn finish_entity(&self, entity_id: &str, status: EntityStatus) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        let stage = match status {
            EntityStatus::Success | EntityStatus::Partial => Stage::Recorded,
            EntityStatus::Failed | EntityStatus::NotStarted => Stage::Failed,
        };
        self.notify(entity_id, stage, Some(status.to_string()));
    }

    /// Entities finished so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Get current progress percentage.
    pub fn percentage(&self) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        let completed = self.completed.load(Ordering::SeqCst);
        (completed as f64 / total as f64) * 100.0
    }

    fn notify(&self, entity_id: &str, stage: Stage, message: Option<String>) {
        if let Some(callback) = &self.callback {
            let update = ProgressUpdate {
                entity_id: entity_id.to_string(),
                stage,
                completed: self.completed.load(Ordering::SeqCst),
                total: self.total.load(Ordering::SeqCst),
                message,
            };
            callback(update);
        }
    }
}

impl Default for MigrationProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Console progress reporter using indicatif.
pub struct ConsoleProgressReporter {
    progress_bar: indicatif::ProgressBar,
}

impl ConsoleProgressReporter {
    /// Create a new console progress reporter.
    pub fn new() -> Self {
        let progress_bar = indicatif::ProgressBar::new(0);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        progress_bar.set_style(style);

        Self { progress_bar }
    }

    /// Create a progress callback for use with a run.
    pub fn callback(&self) -> ProgressCallback {
        let pb = self.progress_bar.clone();
        Box::new(move |update: ProgressUpdate| {
            pb.set_length(update.total);
            pb.set_position(update.completed);

            let mut msg = format!("{}: {}", update.entity_id, update.stage);
            if let Some(message) = &update.message {
                msg = format!("{msg} - {message}");
            }
            pb.set_message(msg);
        })
    }

    /// Finish the progress bar.
    pub fn finish(&self, message: &str) {
        self.progress_bar.finish_with_message(message.to_string());
    }
}

impl Default for ConsoleProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_progress_tracker() {
        let progress = MigrationProgress::new();
        progress.set_total(4);
        assert_eq!(progress.percentage(), 0.0);

        progress.finish_entity("acme/app", EntityStatus::Success);
        assert!((progress.percentage() - 25.0).abs() < 0.01);

        for _ in 0..3 {
            progress.finish_entity("acme/lib", EntityStatus::Failed);
        }
        assert!((progress.percentage() - 100.0).abs() < 0.01);
        assert_eq!(progress.completed(), 4);
    }

    #[test]
    fn test_progress_with_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let progress = MigrationProgress::with_callback(Box::new(move |update| {
            sink.lock().push((update.entity_id, update.stage));
        }));

        progress.set_total(1);
        progress.stage("acme/app", Stage::Preparing);
        progress.stage("acme/app", Stage::Transferring);
        progress.finish_entity("acme/app", EntityStatus::Partial);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], ("acme/app".to_string(), Stage::Recorded));
    }
}
