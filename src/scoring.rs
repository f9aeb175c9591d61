//! Turns ball trajectory geometry into one verdict per net crossing and keeps
//! the session's shot counters.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info};

use crate::companion::FeedbackMessage;
use crate::config::ScoringConfig;
use crate::geometry::NormRect;
use crate::tracker::{BallPosition, BallTracker, TrackerUpdate};

const SIDE_HISTORY_LEN: usize = 10;
const UNKNOWN_ANGLE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossingResult {
    SuccessOverNet,
    FailedHitNet,
    FailedUnderNet,
    Uncertain,
}

impl CrossingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossingResult::SuccessOverNet => "success_over_net",
            CrossingResult::FailedHitNet => "failed_hit_net",
            CrossingResult::FailedUnderNet => "failed_under_net",
            CrossingResult::Uncertain => "uncertain",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CrossingResult::SuccessOverNet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShotCounters {
    pub total_attempts: u32,
    pub successful_shots: u32,
    pub failed_shots: u32,
}

/// Verdict for one crossing episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotVerdict {
    pub result: CrossingResult,
    pub frame_index: u64,
    /// Estimated ball y at the net's leading edge
    pub crossing_height: Option<f32>,
    /// Resolved from the last known trajectory after the ball was lost
    pub inferred: bool,
}

/// Verdict after counters and cooldown were applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredShot {
    pub verdict: ShotVerdict,
    pub counted: bool,
    pub counters: ShotCounters,
    pub message: Option<FeedbackMessage>,
}

/// Left if the ball is before the net's leading edge.
pub fn side_of(x: f32, net: &NormRect) -> Side {
    if x < net.min_x() {
        Side::Left
    } else {
        Side::Right
    }
}

/// Outcome from crossing height against the net's vertical span. Image y grows
/// downward, so a height above the net's top edge is numerically smaller.
pub fn classify_outcome(height: f32, net: &NormRect, forward: bool) -> CrossingResult {
    if height < net.min_y() {
        if forward {
            CrossingResult::SuccessOverNet
        } else {
            CrossingResult::Uncertain
        }
    } else if height <= net.max_y() {
        CrossingResult::FailedHitNet
    } else {
        CrossingResult::FailedUnderNet
    }
}

/// Ball y linearly interpolated at `edge_x` between two samples.
fn height_at_edge(prev: &BallPosition, cur: &BallPosition, edge_x: f32) -> f32 {
    let dx = cur.center.x - prev.center.x;
    if dx.abs() < f32::EPSILON {
        return cur.center.y;
    }
    let t = ((edge_x - prev.center.x) / dx).clamp(0.0, 1.0);
    prev.center.y + t * (cur.center.y - prev.center.y)
}

pub struct ScoringEngine {
    sides: VecDeque<Side>,
    cooldown_frames: u64,
    last_scored_frame: Option<u64>,
    counters: ShotCounters,
}

impl ScoringEngine {
    pub fn new(cooldown_frames: u64) -> Self {
        Self {
            sides: VecDeque::with_capacity(SIDE_HISTORY_LEN),
            cooldown_frames,
            last_scored_frame: None,
            counters: ShotCounters::default(),
        }
    }

    pub fn from_config(config: &ScoringConfig) -> Self {
        Self::new(config.cooldown_frames)
    }

    /// Look for a crossing on the tracker's newest state.
    pub fn detect(&mut self, tracker: &BallTracker, update: &TrackerUpdate) -> Option<ShotVerdict> {
        if update.lost_during_crossing {
            return Some(self.infer_from_lost(tracker));
        }
        if !update.accepted {
            return None;
        }
        let net = tracker.net_box()?;
        let latest = tracker.latest()?;

        let side = side_of(latest.center.x, &net);
        let previous_side = self.sides.back().copied();
        if self.sides.len() == SIDE_HISTORY_LEN {
            self.sides.pop_front();
        }
        self.sides.push_back(side);

        if previous_side != Some(Side::Left) || side != Side::Right {
            return None;
        }

        let height = match tracker.previous() {
            Some(prev) => height_at_edge(prev, latest, net.min_x()),
            None => latest.center.y,
        };
        let forward = tracker.is_moving_forward();
        let result = classify_outcome(height, &net, forward);
        info!(
            frame_index = latest.frame_index,
            height,
            net_top = net.min_y(),
            net_bottom = net.max_y(),
            result = result.as_str(),
            "net crossing"
        );
        Some(ShotVerdict {
            result,
            frame_index: latest.frame_index,
            crossing_height: Some(height),
            inferred: false,
        })
    }

    fn infer_from_lost(&self, tracker: &BallTracker) -> ShotVerdict {
        let frame_index = tracker.latest().map(|p| p.frame_index).unwrap_or_default();
        let estimate = tracker.net_box().and_then(|net| {
            if !tracker.is_moving_forward() {
                return None;
            }
            let height = tracker.extrapolate_height_at(net.min_x())?;
            Some((height, classify_outcome(height, &net, true)))
        });
        let (crossing_height, result) = match estimate {
            Some((h, r)) => (Some(h), r),
            None => (None, CrossingResult::Uncertain),
        };
        info!(frame_index, result = result.as_str(), "crossing inferred from lost ball");
        ShotVerdict {
            result,
            frame_index,
            crossing_height,
            inferred: true,
        }
    }

    /// Update counters for a verdict and build its feedback message.
    pub fn apply(&mut self, verdict: ShotVerdict, angle: Option<&str>) -> ScoredShot {
        let uncounted = |counters| ScoredShot {
            verdict,
            counted: false,
            counters,
            message: None,
        };

        if verdict.result == CrossingResult::Uncertain {
            return uncounted(self.counters);
        }
        if let Some(last) = self.last_scored_frame {
            if verdict.frame_index < last.saturating_add(self.cooldown_frames) {
                debug!(
                    frame_index = verdict.frame_index,
                    last_scored = last,
                    "crossing suppressed by cooldown"
                );
                return uncounted(self.counters);
            }
        }

        self.counters.total_attempts += 1;
        if verdict.result.is_success() {
            self.counters.successful_shots += 1;
        } else {
            self.counters.failed_shots += 1;
        }
        self.last_scored_frame = Some(verdict.frame_index);

        let message = FeedbackMessage::shot_feedback(
            angle.unwrap_or(UNKNOWN_ANGLE),
            verdict.result.is_success(),
        );
        ScoredShot {
            verdict,
            counted: true,
            counters: self.counters,
            message: Some(message),
        }
    }

    pub fn counters(&self) -> ShotCounters {
        self.counters
    }

    /// Forget side history; counters are kept.
    pub fn reset_sides(&mut self) {
        self.sides.clear();
    }

    /// Full reset for a new session.
    pub fn reset_session(&mut self) {
        self.sides.clear();
        self.last_scored_frame = None;
        self.counters = ShotCounters::default();
    }
}
