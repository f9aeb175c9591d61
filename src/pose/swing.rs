use tracing::{debug, warn};

use crate::config::SwingConfig;
use crate::error::RecognitionError;
use crate::recognition::{top_label, LabelScore};

use super::keypoint::PoseKeypointSet;
use super::window::PoseWindow;

/// Outcome of one swing-phase classification.
#[derive(Debug, Clone, PartialEq)]
pub enum SwingResult {
    Phase {
        frame_index: u64,
        label: String,
        confidence: f32,
        /// Rising edge of the impact phase on this frame
        impact_started: bool,
    },
    /// The model call failed for this frame only
    Failed { frame_index: u64, reason: String },
}

/// Accumulates pose samples and turns model output into impact edges.
pub struct SwingPhaseClassifier {
    window: PoseWindow,
    impact_label: String,
    impact_threshold: f32,
    previous_label: Option<String>,
    last_applied_frame: Option<u64>,
}

impl SwingPhaseClassifier {
    pub fn new(window_len: usize, impact_label: impl Into<String>, impact_threshold: f32) -> Self {
        Self {
            window: PoseWindow::new(window_len),
            impact_label: impact_label.into(),
            impact_threshold,
            previous_label: None,
            last_applied_frame: None,
        }
    }

    pub fn from_config(config: &SwingConfig) -> Self {
        Self::new(config.window_len, config.impact_label.clone(), config.impact_threshold)
    }

    /// Append a sample. Returns the model input when the window is exactly full.
    pub fn push(&mut self, pose: PoseKeypointSet) -> Option<Vec<PoseKeypointSet>> {
        self.window.push(pose);
        if self.window.is_full() {
            Some(self.window.snapshot())
        } else {
            None
        }
    }

    /// Apply a model result for the window ending at `frame_index`.
    /// Results older than the last applied one are dropped.
    pub fn apply(
        &mut self,
        frame_index: u64,
        result: Result<Vec<LabelScore>, RecognitionError>,
    ) -> Option<SwingResult> {
        if self.last_applied_frame.is_some_and(|last| frame_index <= last) {
            debug!(frame_index, "dropping out-of-order swing result");
            return None;
        }
        self.last_applied_frame = Some(frame_index);

        let scores = match result {
            Ok(scores) => scores,
            Err(err) => {
                warn!(frame_index, "swing detection failed: {err:#}");
                return Some(SwingResult::Failed {
                    frame_index,
                    reason: err.to_string(),
                });
            }
        };

        let Some(top) = top_label(&scores) else {
            return Some(SwingResult::Failed {
                frame_index,
                reason: "empty label distribution".to_string(),
            });
        };

        let is_impact = top.label == self.impact_label && top.confidence > self.impact_threshold;
        let previous_was_impact = self.previous_label.as_deref() == Some(self.impact_label.as_str());
        let impact_started = is_impact && !previous_was_impact;
        if impact_started {
            debug!(frame_index, confidence = top.confidence, "impact rising edge");
        }
        self.previous_label = Some(top.label.clone());

        Some(SwingResult::Phase {
            frame_index,
            label: top.label.clone(),
            confidence: top.confidence,
            impact_started,
        })
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.previous_label = None;
        self.last_applied_frame = None;
    }
}
