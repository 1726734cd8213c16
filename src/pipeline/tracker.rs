//! Session-scoped counters and progress, published through a watch channel.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::types::PipelineStage;

/// Per-stage counters, cumulative across the rounds of a session.
///
/// After generation completes, `generated == pass1_pending + pass1_passed +
/// pass1_rejected`; once Pass 2 is scheduled, `pass1_passed == pass2_pending +
/// pass2_passed + pass2_rejected`. Operations that are cancelled stay pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub generated: usize,
    pub pass1_pending: usize,
    pub pass1_passed: usize,
    pub pass1_rejected: usize,
    pub pass2_pending: usize,
    pub pass2_passed: usize,
    pub pass2_rejected: usize,
    pub executing: usize,
    pub completed: usize,
    /// Executions that ended in an error.
    pub failed: usize,
}

impl PipelineStats {
    pub fn record_generated(&mut self, count: usize) {
        self.generated += count;
        self.pass1_pending += count;
    }

    pub fn record_pass1(&mut self, passed: bool) {
        self.pass1_pending = self.pass1_pending.saturating_sub(1);
        if passed {
            self.pass1_passed += 1;
        } else {
            self.pass1_rejected += 1;
        }
    }

    pub fn schedule_pass2(&mut self, count: usize) {
        self.pass2_pending += count;
    }

    pub fn record_pass2(&mut self, passed: bool) {
        self.pass2_pending = self.pass2_pending.saturating_sub(1);
        if passed {
            self.pass2_passed += 1;
        } else {
            self.pass2_rejected += 1;
        }
    }

    pub fn start_execution(&mut self) {
        self.executing += 1;
    }

    pub fn finish_execution(&mut self, succeeded: bool) {
        self.executing = self.executing.saturating_sub(1);
        if succeeded {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    /// An execution was cancelled; it counts as neither completed nor failed.
    pub fn abandon_execution(&mut self) {
        self.executing = self.executing.saturating_sub(1);
    }

    pub fn pass1_balanced(&self) -> bool {
        self.generated == self.pass1_pending + self.pass1_passed + self.pass1_rejected
    }

    pub fn pass2_balanced(&self) -> bool {
        self.pass1_passed == self.pass2_pending + self.pass2_passed + self.pass2_rejected
    }
}

/// Where the current round is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    pub stage: PipelineStage,
    pub round: u32,
    /// Operations finished in the current stage.
    pub completed: usize,
    /// Operations scheduled in the current stage.
    pub total: usize,
    pub running: bool,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PipelineProgress {
    /// Completion of the current stage in percent; 0 when nothing is scheduled.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed.min(self.total) as f64 / self.total as f64) * 100.0
        }
    }
}

/// Value published to observers on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub stats: PipelineStats,
    pub progress: PipelineProgress,
}

/// Serialized update path for stats and progress.
///
/// All mutation goes through [`watch::Sender::send_modify`], so concurrent
/// completions are applied one at a time and subscribers always see a
/// consistent snapshot.
#[derive(Debug)]
pub struct SessionTracker {
    tx: watch::Sender<PipelineSnapshot>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PipelineSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.tx.borrow().clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.tx.borrow().stats
    }

    pub fn update_stats(&self, update: impl FnOnce(&mut PipelineStats)) {
        self.tx.send_modify(|snapshot| update(&mut snapshot.stats));
    }

    /// Enter a stage with `total` operations scheduled.
    pub fn enter_stage(&self, stage: PipelineStage, total: usize) {
        self.tx.send_modify(|snapshot| {
            snapshot.progress.stage = stage;
            snapshot.progress.completed = 0;
            snapshot.progress.total = total;
        });
    }

    /// Count one finished operation, optionally updating stats in the same step.
    pub fn advance(&self, update: impl FnOnce(&mut PipelineStats)) {
        self.tx.send_modify(|snapshot| {
            update(&mut snapshot.stats);
            snapshot.progress.completed += 1;
        });
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|snapshot| snapshot.progress.message = Some(message));
    }

    pub fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_modify(|snapshot| snapshot.progress.last_error = Some(error));
    }

    pub fn set_round(&self, round: u32) {
        self.tx.send_modify(|snapshot| snapshot.progress.round = round);
    }

    pub fn set_flags(&self, running: bool, paused: bool) {
        self.tx.send_if_modified(|snapshot| {
            let changed = snapshot.progress.running != running || snapshot.progress.paused != paused;
            snapshot.progress.running = running;
            snapshot.progress.paused = paused;
            changed
        });
    }

    /// Zero everything for a fresh session.
    pub fn reset(&self) {
        self.tx.send_replace(PipelineSnapshot::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pass1_counters_stay_balanced() {
        let mut stats = PipelineStats::default();
        stats.record_generated(4);
        assert!(stats.pass1_balanced());

        stats.record_pass1(true);
        stats.record_pass1(false);
        stats.record_pass1(true);
        assert!(stats.pass1_balanced());
        assert_eq!(stats.pass1_pending, 1);

        stats.schedule_pass2(stats.pass1_passed);
        stats.record_pass2(true);
        assert!(stats.pass2_balanced());
    }

    #[test]
    fn test_execution_counters() {
        let mut stats = PipelineStats::default();
        stats.start_execution();
        stats.start_execution();
        stats.finish_execution(true);
        stats.finish_execution(false);

        assert_eq!(stats.executing, 0);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_progress_percent() {
        let progress = PipelineProgress {
            completed: 1,
            total: 4,
            ..Default::default()
        };
        assert_eq!(progress.percent(), 25.0);
        assert_eq!(PipelineProgress::default().percent(), 0.0);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let tracker = SessionTracker::new();
        let mut rx = tracker.subscribe();

        tracker.enter_stage(PipelineStage::Pass1, 3);
        tracker.advance(|stats| stats.record_generated(3));

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.progress.stage, PipelineStage::Pass1);
        assert_eq!(snapshot.progress.completed, 1);
        assert_eq!(snapshot.stats.generated, 3);
    }

    #[test]
    fn test_reset_clears_snapshot() {
        let tracker = SessionTracker::new();
        tracker.update_stats(|stats| stats.record_generated(2));
        tracker.set_round(3);
        tracker.reset();
        assert_eq!(tracker.snapshot(), PipelineSnapshot::default());
    }
}
