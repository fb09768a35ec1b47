//! Section detection as a background job.
//!
//! The worker thread owns its inputs: a read-only connection to the store
//! (or a preloaded snapshot for in-memory stores), the section config and a
//! clone of the shared progress. It never touches the engine. Results come
//! back over a channel and are committed by whoever polls.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use log::{info, warn};
use rusqlite::Connection;

use super::{schema, PersistentRouteEngine};
use crate::error::{EngineError, Result};
use crate::sections::{detect_sections_multiscale, DetectionPhase, DetectionProgress};
use crate::{GpsPoint, MultiScaleSectionResult, SectionConfig};

/// How a detection job ended.
#[derive(Debug)]
pub enum DetectionOutcome {
    Complete(MultiScaleSectionResult),
    Cancelled,
    Failed(String),
}

/// A running detection job.
#[derive(Debug)]
pub struct SectionDetectionHandle {
    receiver: Receiver<DetectionOutcome>,
    progress: DetectionProgress,
    sport_type: Option<String>,
}

impl SectionDetectionHandle {
    pub fn progress(&self) -> &DetectionProgress {
        &self.progress
    }

    /// Ask the worker to stop at its next phase boundary.
    pub fn cancel(&self) {
        self.progress.cancel();
    }

    /// The outcome, once the worker has finished.
    pub fn try_recv(&self) -> Option<DetectionOutcome> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(DetectionOutcome::Failed(
                "detection worker exited without a result".to_string(),
            )),
        }
    }
}

/// Where the worker gets its tracks.
enum TrackSource {
    /// Path of a file-backed store, opened read-only on the worker
    Store(String),
    /// Tracks read up front, for stores a second connection cannot see
    Preloaded(Vec<(String, Vec<GpsPoint>)>),
}

/// Read the full tracks for `(activity id, sport)` pairs, skipping missing ones.
pub(super) fn load_tracks(
    conn: &Connection,
    input: &[(String, String)],
) -> Result<Vec<(String, Vec<GpsPoint>)>> {
    let mut tracks = Vec::with_capacity(input.len());
    for (id, _) in input {
        if let Some(track) = super::read_track(conn, id)? {
            tracks.push((id.clone(), track));
        }
    }
    Ok(tracks)
}

fn run_detection(
    source: TrackSource,
    input: &[(String, String)],
    config: &SectionConfig,
    progress: &DetectionProgress,
) -> DetectionOutcome {
    progress.set_phase(DetectionPhase::Loading, input.len() as u32);
    let tracks = match source {
        TrackSource::Preloaded(tracks) => tracks,
        TrackSource::Store(path) => {
            match schema::open_reader(&path).and_then(|conn| load_tracks(&conn, input)) {
                Ok(tracks) => tracks,
                Err(e) => return DetectionOutcome::Failed(e.to_string()),
            }
        }
    };

    let sports: HashMap<String, String> = input.iter().cloned().collect();
    match detect_sections_multiscale(&tracks, &sports, config, progress) {
        Ok(result) => DetectionOutcome::Complete(result),
        Err(_) => DetectionOutcome::Cancelled,
    }
}

fn terminal_phase(outcome: &DetectionOutcome) -> DetectionPhase {
    match outcome {
        DetectionOutcome::Complete(_) => DetectionPhase::Complete,
        DetectionOutcome::Cancelled => DetectionPhase::Cancelled,
        DetectionOutcome::Failed(_) => DetectionPhase::Error,
    }
}

impl PersistentRouteEngine {
    /// Start detecting sections in the background, for one sport or all.
    pub fn start_section_detection(&mut self, sport_type: Option<&str>) -> Result<()> {
        if self.detection.is_some() {
            return Err(EngineError::DetectionInProgress);
        }

        let input = self.detection_input(sport_type);
        let source = if self.is_in_memory() {
            TrackSource::Preloaded(load_tracks(&self.db, &input)?)
        } else {
            TrackSource::Store(self.db_path.clone())
        };
        let config = self.config.section_config.clone();
        let progress = DetectionProgress::new();
        let worker_progress = progress.clone();
        let (sender, receiver) = mpsc::channel();

        info!(
            "[Detection] Starting for {} activities ({})",
            input.len(),
            sport_type.unwrap_or("all sports")
        );

        thread::Builder::new()
            .name("section-detection".to_string())
            .spawn(move || {
                let outcome = run_detection(source, &input, &config, &worker_progress);
                let phase = terminal_phase(&outcome);
                // The poller may have dropped the handle
                let _ = sender.send(outcome);
                // Set after sending, so a terminal phase implies a pending result
                worker_progress.set_phase(phase, 0);
            })
            .map_err(|e| EngineError::Internal(format!("failed to spawn detection: {}", e)))?;

        self.detection = Some(SectionDetectionHandle {
            receiver,
            progress,
            sport_type: sport_type.map(str::to_string),
        });
        Ok(())
    }

    /// Current detection state.
    ///
    /// Returns the running phase name, then exactly once `"complete"`,
    /// `"cancelled"` or `"error"` when the job ends, and `"idle"` when no job
    /// is running. A completed result is committed before this returns.
    pub fn poll_section_detection(&mut self) -> String {
        let Some(handle) = &self.detection else {
            return "idle".to_string();
        };
        let phase = handle.progress.phase();
        let Some(outcome) = handle.try_recv() else {
            return phase.as_str().to_string();
        };
        let sport_type = handle.sport_type.clone();
        self.detection = None;

        match outcome {
            DetectionOutcome::Complete(result) => {
                info!(
                    "[Detection] Complete: {} sections in {}ms",
                    result.sections.len(),
                    result.stats.elapsed_ms
                );
                if let Err(e) = self.apply_sections(result.sections, sport_type.as_deref()) {
                    warn!("[Detection] Failed to commit sections: {}", e);
                    return DetectionPhase::Error.as_str().to_string();
                }
                if let Err(e) = self.rematch_custom_sections() {
                    warn!("[Detection] Custom section matching failed: {}", e);
                }
                DetectionPhase::Complete.as_str().to_string()
            }
            DetectionOutcome::Cancelled => {
                info!("[Detection] Cancelled");
                DetectionPhase::Cancelled.as_str().to_string()
            }
            DetectionOutcome::Failed(message) => {
                warn!("[Detection] Failed: {}", message);
                DetectionPhase::Error.as_str().to_string()
            }
        }
    }

    /// `{"phase", "completed", "total"}` of the running job, or an idle record.
    pub fn get_section_detection_progress(&self) -> serde_json::Value {
        match &self.detection {
            Some(handle) => handle.progress.to_json(),
            None => serde_json::json!({ "phase": "idle", "completed": 0, "total": 0 }),
        }
    }

    /// Request cancellation. Returns false if nothing is running.
    pub fn cancel_section_detection(&mut self) -> bool {
        match &self.detection {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_detection_running(&self) -> bool {
        self.detection.is_some()
    }
}
