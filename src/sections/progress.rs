//! Detection phases and thread-shared progress state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Phase of a section detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPhase {
    Loading,
    BuildingRtrees,
    FindingOverlaps,
    Clustering,
    BuildingSections,
    Postprocessing,
    Complete,
    Cancelled,
    Error,
}

impl DetectionPhase {
    /// Wire name, e.g. `"finding_overlaps"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionPhase::Loading => "loading",
            DetectionPhase::BuildingRtrees => "building_rtrees",
            DetectionPhase::FindingOverlaps => "finding_overlaps",
            DetectionPhase::Clustering => "clustering",
            DetectionPhase::BuildingSections => "building_sections",
            DetectionPhase::Postprocessing => "postprocessing",
            DetectionPhase::Complete => "complete",
            DetectionPhase::Cancelled => "cancelled",
            DetectionPhase::Error => "error",
        }
    }

    /// True for `complete`, `cancelled` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DetectionPhase::Complete | DetectionPhase::Cancelled | DetectionPhase::Error
        )
    }
}

impl fmt::Display for DetectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by the detector when a cancel request was seen at a phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("section detection cancelled")]
pub struct DetectionAborted;

/// Sink for detector progress. Implementations must tolerate calls from
/// several rayon workers at once.
pub trait DetectionProgressCallback: Send + Sync {
    /// A new phase starts with `total` work items.
    fn on_phase(&self, phase: DetectionPhase, total: u32);

    /// One work item of the current phase finished.
    fn on_progress(&self);

    /// Polled between phases.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Progress sink that ignores everything.
impl DetectionProgressCallback for () {
    fn on_phase(&self, _phase: DetectionPhase, _total: u32) {}
    fn on_progress(&self) {}
}

/// Progress state shared between the detection thread and pollers.
///
/// Only the detection thread writes the phase and counters; pollers read
/// them and may raise the cancel flag.
#[derive(Debug, Clone)]
pub struct DetectionProgress {
    phase: Arc<Mutex<DetectionPhase>>,
    completed: Arc<AtomicU32>,
    total: Arc<AtomicU32>,
    cancelled: Arc<AtomicBool>,
}

impl Default for DetectionProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionProgress {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new(DetectionPhase::Loading)),
            completed: Arc::new(AtomicU32::new(0)),
            total: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_phase(&self, phase: DetectionPhase, total: u32) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn increment(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn phase(&self) -> DetectionPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// Request cancellation. Takes effect at the next phase boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `{"phase": .., "completed": .., "total": ..}` for pollers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "phase": self.phase().as_str(),
            "completed": self.completed(),
            "total": self.total(),
        })
    }
}

impl DetectionProgressCallback for DetectionProgress {
    fn on_phase(&self, phase: DetectionPhase, total: u32) {
        self.set_phase(phase, total);
    }

    fn on_progress(&self) {
        self.increment();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        assert_eq!(DetectionPhase::BuildingRtrees.as_str(), "building_rtrees");
        assert_eq!(
            serde_json::to_string(&DetectionPhase::FindingOverlaps).unwrap(),
            "\"finding_overlaps\""
        );
        assert!(DetectionPhase::Cancelled.is_terminal());
        assert!(!DetectionPhase::Postprocessing.is_terminal());
    }

    #[test]
    fn test_progress_shared_between_clones() {
        let progress = DetectionProgress::new();
        let worker = progress.clone();

        worker.on_phase(DetectionPhase::Clustering, 3);
        worker.on_progress();
        worker.on_progress();

        assert_eq!(progress.phase(), DetectionPhase::Clustering);
        assert_eq!(progress.completed(), 2);
        assert_eq!(progress.total(), 3);

        progress.cancel();
        assert!(worker.is_cancelled());

        let json = progress.to_json();
        assert_eq!(json["phase"], "clustering");
        assert_eq!(json["total"], 3);
    }
}
