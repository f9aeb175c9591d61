//! Racquet-face angle analysis triggered by racquet/ball proximity.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AngleConfig;
use crate::geometry::NormRect;
use crate::recognition::{top_label, LabelScore, RecognitionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RacquetFace {
    Open,
    Flat,
    Closed,
}

impl RacquetFace {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "open" | "open_face" => Some(Self::Open),
            "flat" | "neutral" => Some(Self::Flat),
            "closed" | "closed_face" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RacquetFace::Open => "open",
            RacquetFace::Flat => "flat",
            RacquetFace::Closed => "closed",
        }
    }
}

/// Request to classify the frame that produced a proximity signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleTrigger {
    pub generation: u64,
    pub frame_index: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleResult {
    pub face: RacquetFace,
    pub confidence: f32,
    pub frame_index: u64,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AngleUpdate {
    pub trigger: Option<AngleTrigger>,
    /// Proximity was lost on this frame and the current angle dropped
    pub cleared: bool,
}

pub struct AngleController {
    proximity_threshold: f32,
    cooldown: f64,
    last_trigger: Option<f64>,
    generation: u64,
    in_proximity: bool,
    current: Option<AngleResult>,
}

impl AngleController {
    pub fn new(proximity_threshold: f32, cooldown_secs: f64) -> Self {
        Self {
            proximity_threshold,
            cooldown: cooldown_secs,
            last_trigger: None,
            generation: 0,
            in_proximity: false,
            current: None,
        }
    }

    pub fn from_config(config: &AngleConfig) -> Self {
        Self::new(config.proximity_threshold, config.cooldown_secs)
    }

    /// Check one frame's accepted racquet and ball boxes.
    ///
    /// A frame missing either box counts as out of proximity.
    pub fn observe(
        &mut self,
        frame_index: u64,
        timestamp: f64,
        racquet: Option<NormRect>,
        ball: Option<NormRect>,
    ) -> AngleUpdate {
        let distance = match (racquet, ball) {
            (Some(r), Some(b)) => Some(r.center().distance(&b.center())),
            _ => None,
        };
        let near = distance.is_some_and(|d| d <= self.proximity_threshold);

        if !near {
            let mut update = AngleUpdate::default();
            if self.in_proximity {
                // 近接解除: 古い推論結果は破棄する
                self.in_proximity = false;
                self.generation += 1;
                update.cleared = self.current.take().is_some();
                debug!(frame_index, generation = self.generation, "racquet proximity lost");
            }
            return update;
        }
        self.in_proximity = true;

        let cooled = self
            .last_trigger
            .map_or(true, |last| timestamp - last >= self.cooldown);
        if !cooled {
            return AngleUpdate::default();
        }
        self.last_trigger = Some(timestamp);
        debug!(frame_index, distance, "angle analysis triggered");
        AngleUpdate {
            trigger: Some(AngleTrigger {
                generation: self.generation,
                frame_index,
                timestamp,
            }),
            cleared: false,
        }
    }

    /// Apply a classifier completion. Results for a stale trigger, failed calls
    /// and unknown labels are dropped.
    pub fn accept(
        &mut self,
        trigger: AngleTrigger,
        result: RecognitionResult<Vec<LabelScore>>,
    ) -> Option<AngleResult> {
        if trigger.generation != self.generation {
            debug!(
                frame_index = trigger.frame_index,
                trigger_generation = trigger.generation,
                generation = self.generation,
                "stale angle result dropped"
            );
            return None;
        }
        let scores = match result {
            Ok(scores) => scores,
            Err(e) => {
                warn!(frame_index = trigger.frame_index, error = %e, "angle classification failed");
                return None;
            }
        };
        let top = top_label(&scores)?;
        let Some(face) = RacquetFace::from_label(&top.label) else {
            warn!(label = %top.label, "unknown racquet face label");
            return None;
        };
        let result = AngleResult {
            face,
            confidence: top.confidence,
            frame_index: trigger.frame_index,
            timestamp: trigger.timestamp,
        };
        self.current = Some(result);
        Some(result)
    }

    pub fn current(&self) -> Option<&AngleResult> {
        self.current.as_ref()
    }

    /// Invalidates in-flight triggers as well.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.last_trigger = None;
        self.in_proximity = false;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecognitionError;

    fn rect_at(x: f32, y: f32) -> Option<NormRect> {
        Some(NormRect::new(x - 0.05, y - 0.05, 0.1, 0.1))
    }

    fn flat() -> RecognitionResult<Vec<LabelScore>> {
        Ok(vec![LabelScore::new("open", 0.2), LabelScore::new("flat", 0.8)])
    }

    #[test]
    fn test_triggers_within_threshold() {
        let mut ctl = AngleController::new(0.22, 0.1);
        let update = ctl.observe(0, 0.0, rect_at(0.5, 0.5), rect_at(0.6, 0.6));
        assert!(update.trigger.is_some());
        let far = ctl.observe(1, 0.5, rect_at(0.1, 0.1), rect_at(0.6, 0.6));
        assert!(far.trigger.is_none());
    }

    #[test]
    fn test_missing_box_never_triggers() {
        let mut ctl = AngleController::new(0.22, 0.1);
        assert!(ctl.observe(0, 0.0, rect_at(0.5, 0.5), None).trigger.is_none());
        assert!(ctl.observe(1, 0.1, None, rect_at(0.5, 0.5)).trigger.is_none());
    }

    #[test]
    fn test_cooldown() {
        let mut ctl = AngleController::new(0.22, 0.1);
        assert!(ctl.observe(0, 0.0, rect_at(0.5, 0.5), rect_at(0.55, 0.5)).trigger.is_some());
        assert!(ctl.observe(1, 0.033, rect_at(0.5, 0.5), rect_at(0.55, 0.5)).trigger.is_none());
        assert!(ctl.observe(2, 0.066, rect_at(0.5, 0.5), rect_at(0.55, 0.5)).trigger.is_none());
        assert!(ctl.observe(3, 0.1, rect_at(0.5, 0.5), rect_at(0.55, 0.5)).trigger.is_some());
    }

    #[test]
    fn test_accept_sets_current() {
        let mut ctl = AngleController::new(0.22, 0.1);
        let trigger = ctl
            .observe(4, 0.2, rect_at(0.5, 0.5), rect_at(0.55, 0.5))
            .trigger
            .unwrap();
        let result = ctl.accept(trigger, flat()).unwrap();
        assert_eq!(result.face, RacquetFace::Flat);
        assert_eq!(result.frame_index, 4);
        assert_eq!(ctl.current().unwrap().face, RacquetFace::Flat);
    }

    #[test]
    fn test_proximity_lost_clears_and_drops_late_result() {
        let mut ctl = AngleController::new(0.22, 0.1);
        let first = ctl
            .observe(0, 0.0, rect_at(0.5, 0.5), rect_at(0.55, 0.5))
            .trigger
            .unwrap();
        assert!(ctl.accept(first, flat()).is_some());

        let second = ctl
            .observe(5, 0.2, rect_at(0.5, 0.5), rect_at(0.55, 0.5))
            .trigger
            .unwrap();
        let update = ctl.observe(6, 0.233, rect_at(0.1, 0.1), rect_at(0.9, 0.9));
        assert!(update.cleared);
        assert!(ctl.current().is_none());

        // completion for the pre-loss trigger arrives late
        assert!(ctl.accept(second, flat()).is_none());
        assert!(ctl.current().is_none());
    }

    #[test]
    fn test_failed_and_unknown_results_ignored() {
        let mut ctl = AngleController::new(0.22, 0.1);
        let trigger = ctl
            .observe(0, 0.0, rect_at(0.5, 0.5), rect_at(0.55, 0.5))
            .trigger
            .unwrap();
        let failed = Err(RecognitionError::output("angle", "empty tensor"));
        assert!(ctl.accept(trigger, failed).is_none());
        assert!(ctl
            .accept(trigger, Ok(vec![LabelScore::new("sideways", 0.9)]))
            .is_none());
        assert!(ctl.current().is_none());
    }

    #[test]
    fn test_reset_invalidates_in_flight() {
        let mut ctl = AngleController::new(0.22, 0.1);
        let trigger = ctl
            .observe(0, 0.0, rect_at(0.5, 0.5), rect_at(0.55, 0.5))
            .trigger
            .unwrap();
        ctl.reset();
        assert!(ctl.accept(trigger, flat()).is_none());
    }
}
