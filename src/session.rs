//! Mutable state of one processing session.
//!
//! `SessionState` is owned by a single task; every recognition completion is
//! applied through one of its `on_*` methods, which return the side effects
//! (events, outbound messages, follow-up model requests) for the caller to run.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::angle::{AngleController, AngleResult, AngleTrigger, RacquetFace};
use crate::companion::FeedbackMessage;
use crate::config::{Config, PresenceConfig};
use crate::detection::{DetectedObject, FilteredDetections, ObjectFilter};
use crate::pose::{PoseKeypointSet, SwingPhaseClassifier, SwingResult};
use crate::recognition::{LabelScore, RecognitionResult};
use crate::scoring::{ScoredShot, ScoringEngine, ShotCounters};
use crate::tracker::{BallState, BallTracker};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Accepted detections of a frame, for display
    Detections {
        frame_index: u64,
        detections: FilteredDetections,
        ball_state: BallState,
    },
    Crossing(ScoredShot),
    Angle(AngleResult),
    AngleCleared { frame_index: u64 },
    Swing {
        result: SwingResult,
        shot_in_progress: bool,
    },
    Presence { frame_index: u64, present: bool },
}

/// Side effects of applying one completion.
#[derive(Debug, Default)]
pub struct Effects {
    pub events: Vec<SessionEvent>,
    pub messages: Vec<FeedbackMessage>,
    pub angle_request: Option<AngleTrigger>,
    /// Full pose window, oldest first
    pub swing_request: Option<Vec<PoseKeypointSet>>,
}

/// Finalized summary of a session, handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub timestamp: DateTime<Local>,
    pub total_attempts: u32,
    pub successful_shots: u32,
    pub failed_shots: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_reference: Option<String>,
    /// Seconds since session start at which each racquet face was classified
    #[serde(default)]
    pub angle_timestamps: BTreeMap<RacquetFace, Vec<f64>>,
}

/// Tracks whether the player is in frame from pose confidence.
pub struct PresenceMonitor {
    min_confidence: f32,
    absent_frames: u32,
    absent_streak: u32,
    absent: bool,
}

impl PresenceMonitor {
    pub fn new(min_confidence: f32, absent_frames: u32) -> Self {
        Self {
            min_confidence,
            absent_frames: absent_frames.max(1),
            absent_streak: 0,
            absent: false,
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::new(config.min_confidence, config.absent_frames)
    }

    /// Returns `Some(present)` when presence changed on this sample.
    pub fn observe(&mut self, average_confidence: f32) -> Option<bool> {
        if average_confidence >= self.min_confidence {
            self.absent_streak = 0;
            if self.absent {
                self.absent = false;
                return Some(true);
            }
            return None;
        }
        self.absent_streak = self.absent_streak.saturating_add(1);
        if !self.absent && self.absent_streak >= self.absent_frames {
            self.absent = true;
            return Some(false);
        }
        None
    }

    pub fn is_absent(&self) -> bool {
        self.absent
    }

    pub fn reset(&mut self) {
        self.absent_streak = 0;
        self.absent = false;
    }
}

pub struct SessionState {
    filter: ObjectFilter,
    tracker: BallTracker,
    scoring: ScoringEngine,
    angle: AngleController,
    swing: SwingPhaseClassifier,
    presence: PresenceMonitor,
    started_at: DateTime<Local>,
    /// Capture timestamp of the first frame seen this session
    origin: Option<f64>,
    last_detection_frame: Option<u64>,
    last_pose_frame: Option<u64>,
    angle_log: BTreeMap<RacquetFace, Vec<f64>>,
    last_face: Option<RacquetFace>,
    shot_in_progress: bool,
    video_reference: Option<String>,
}

impl SessionState {
    pub fn new(config: &Config) -> Self {
        Self {
            filter: ObjectFilter::from_config(&config.detection),
            tracker: BallTracker::from_config(&config.tracker),
            scoring: ScoringEngine::from_config(&config.scoring),
            angle: AngleController::from_config(&config.angle),
            swing: SwingPhaseClassifier::from_config(&config.swing),
            presence: PresenceMonitor::from_config(&config.presence),
            started_at: Local::now(),
            origin: None,
            last_detection_frame: None,
            last_pose_frame: None,
            angle_log: BTreeMap::new(),
            last_face: None,
            shot_in_progress: false,
            video_reference: None,
        }
    }

    fn session_secs(&mut self, timestamp: f64) -> f64 {
        let origin = *self.origin.get_or_insert(timestamp);
        (timestamp - origin).max(0.0)
    }

    pub fn on_detections(
        &mut self,
        frame_index: u64,
        timestamp: f64,
        result: RecognitionResult<Vec<DetectedObject>>,
    ) -> Effects {
        let mut effects = Effects::default();
        // trajectory must stay time-ordered
        if self.last_detection_frame.is_some_and(|last| frame_index <= last) {
            debug!(frame_index, "dropping out-of-order detections");
            return effects;
        }
        let candidates = match result {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(frame_index, "object detection failed: {:#}", e);
                return effects;
            }
        };
        self.last_detection_frame = Some(frame_index);
        self.session_secs(timestamp);

        let detections = self.filter.apply(&candidates);
        let ball = detections.ball.map(|d| d.bbox);
        let net = detections.net.map(|d| d.bbox);
        let racquet = detections.racquet.map(|d| d.bbox);

        let update = self.tracker.observe(frame_index, timestamp, ball, net);
        effects.events.push(SessionEvent::Detections {
            frame_index,
            detections,
            ball_state: update.state,
        });

        if let Some(verdict) = self.scoring.detect(&self.tracker, &update) {
            let shot = self
                .scoring
                .apply(verdict, self.last_face.map(|face| face.as_str()));
            // 判定後は二重カウント防止のため追跡状態をリセット
            self.tracker.reset_all_tracking();
            self.scoring.reset_sides();
            self.shot_in_progress = false;
            if shot.counted {
                let c = shot.counters;
                info!(
                    result = shot.verdict.result.as_str(),
                    total = c.total_attempts,
                    success = c.successful_shots,
                    failed = c.failed_shots,
                    "shot scored"
                );
            }
            if let Some(message) = &shot.message {
                effects.messages.push(message.clone());
            }
            effects.events.push(SessionEvent::Crossing(shot));
        }

        let angle = self.angle.observe(frame_index, timestamp, racquet, ball);
        if angle.cleared {
            effects.events.push(SessionEvent::AngleCleared { frame_index });
        }
        effects.angle_request = angle.trigger;
        effects
    }

    pub fn on_pose(&mut self, frame_index: u64, result: RecognitionResult<PoseKeypointSet>) -> Effects {
        let mut effects = Effects::default();
        // swing window and presence streak are chronological
        if self.last_pose_frame.is_some_and(|last| frame_index <= last) {
            debug!(frame_index, "dropping out-of-order pose");
            return effects;
        }
        let pose = match result {
            Ok(pose) => pose,
            Err(e) => {
                warn!(frame_index, "pose estimation failed: {:#}", e);
                return effects;
            }
        };
        self.last_pose_frame = Some(frame_index);

        if let Some(present) = self.presence.observe(pose.average_confidence()) {
            info!(frame_index, present, "player presence changed");
            effects.messages.push(if present {
                FeedbackMessage::back_in_frame()
            } else {
                FeedbackMessage::not_in_frame()
            });
            effects.events.push(SessionEvent::Presence { frame_index, present });
        }

        effects.swing_request = self.swing.push(pose);
        effects
    }

    /// `frame_index` is the newest sample of the classified window.
    pub fn on_swing(&mut self, frame_index: u64, result: RecognitionResult<Vec<LabelScore>>) -> Effects {
        let mut effects = Effects::default();
        let Some(result) = self.swing.apply(frame_index, result) else {
            return effects;
        };
        if let SwingResult::Phase {
            impact_started: true,
            ..
        } = result
        {
            if self.shot_in_progress {
                debug!(frame_index, "impact while previous shot unresolved");
            }
            self.shot_in_progress = true;
        }
        effects.events.push(SessionEvent::Swing {
            result,
            shot_in_progress: self.shot_in_progress,
        });
        effects
    }

    pub fn on_angle(&mut self, trigger: AngleTrigger, result: RecognitionResult<Vec<LabelScore>>) -> Effects {
        let mut effects = Effects::default();
        let Some(angle) = self.angle.accept(trigger, result) else {
            return effects;
        };
        self.last_face = Some(angle.face);
        let at = self.session_secs(angle.timestamp);
        self.angle_log.entry(angle.face).or_default().push(at);
        debug!(frame_index = angle.frame_index, face = angle.face.as_str(), "racquet face");
        effects.messages.push(FeedbackMessage::angle_feedback(angle.face.as_str()));
        effects.events.push(SessionEvent::Angle(angle));
        effects
    }

    pub fn counters(&self) -> ShotCounters {
        self.scoring.counters()
    }

    pub fn ball_state(&self) -> BallState {
        self.tracker.state()
    }

    pub fn current_angle(&self) -> Option<&AngleResult> {
        self.angle.current()
    }

    pub fn is_shot_in_progress(&self) -> bool {
        self.shot_in_progress
    }

    pub fn set_video_reference(&mut self, reference: impl Into<String>) {
        self.video_reference = Some(reference.into());
    }

    /// Start a new session: all tracking state and counters are cleared.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.tracker.reset_all_tracking();
        self.scoring.reset_session();
        self.angle.reset();
        self.swing.reset();
        self.presence.reset();
        self.started_at = Local::now();
        self.origin = None;
        self.last_detection_frame = None;
        self.last_pose_frame = None;
        self.angle_log.clear();
        self.last_face = None;
        self.shot_in_progress = false;
        self.video_reference = None;
    }

    pub fn finish(&self) -> SessionRecord {
        let counters = self.scoring.counters();
        SessionRecord {
            timestamp: self.started_at,
            total_attempts: counters.total_attempts,
            successful_shots: counters.successful_shots,
            failed_shots: counters.failed_shots,
            video_reference: self.video_reference.clone(),
            angle_timestamps: self.angle_log.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::companion::MessageKind;
    use crate::detection::ObjectLabel;
    use crate::error::RecognitionError;
    use crate::geometry::NormRect;
    use crate::pose::Keypoint;
    use crate::scoring::CrossingResult;

    fn config() -> Config {
        let mut config = Config::default();
        config.swing.window_len = 3;
        config.presence.absent_frames = 2;
        config
    }

    fn net() -> DetectedObject {
        DetectedObject::new(ObjectLabel::Net, 0.9, NormRect::from_edges(0.45, 0.4, 0.55, 0.6))
    }

    fn ball(x: f32, y: f32) -> DetectedObject {
        DetectedObject::new(ObjectLabel::Ball, 0.9, NormRect::new(x - 0.01, y - 0.01, 0.02, 0.02))
    }

    fn racquet(x: f32, y: f32) -> DetectedObject {
        DetectedObject::new(ObjectLabel::Racquet, 0.9, NormRect::new(x - 0.05, y - 0.05, 0.1, 0.1))
    }

    fn pose(frame_index: u64, confidence: f32) -> PoseKeypointSet {
        let mut set = PoseKeypointSet::default();
        set.frame_index = frame_index;
        for kp in set.keypoints.iter_mut() {
            *kp = Keypoint::new(0.5, 0.5, confidence);
        }
        set
    }

    fn crossings(effects: &Effects) -> Vec<&ScoredShot> {
        effects
            .events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Crossing(shot) => Some(shot),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_crossing_scores_and_resets_tracking() {
        let mut session = SessionState::new(&config());
        session.on_detections(0, 0.0, Ok(vec![net(), ball(0.3, 0.3)]));
        session.on_detections(1, 0.033, Ok(vec![net(), ball(0.4, 0.3)]));
        let effects = session.on_detections(2, 0.066, Ok(vec![net(), ball(0.6, 0.3)]));

        let shots = crossings(&effects);
        assert_eq!(shots.len(), 1);
        assert_eq!(shots[0].verdict.result, CrossingResult::SuccessOverNet);
        assert_eq!(effects.messages.len(), 1);
        assert_eq!(effects.messages[0].kind(), MessageKind::ShotFeedback);
        assert_eq!(effects.messages[0].angle(), Some("unknown"));
        assert_eq!(session.counters().successful_shots, 1);
        assert_eq!(session.ball_state(), BallState::Unknown);
    }

    #[test]
    fn test_detection_failure_is_skipped() {
        let mut session = SessionState::new(&config());
        let effects = session.on_detections(
            0,
            0.0,
            Err(RecognitionError::output("objects", "bad tensor shape")),
        );
        assert!(effects.events.is_empty());
        assert!(effects.messages.is_empty());
        assert_eq!(session.ball_state(), BallState::Unknown);
    }

    #[test]
    fn test_out_of_order_detections_dropped() {
        let mut session = SessionState::new(&config());
        session.on_detections(5, 0.165, Ok(vec![net(), ball(0.3, 0.3)]));
        let effects = session.on_detections(4, 0.132, Ok(vec![net(), ball(0.2, 0.3)]));
        assert!(effects.events.is_empty());
    }

    #[test]
    fn test_angle_feeds_shot_feedback() {
        let mut session = SessionState::new(&config());
        let effects = session.on_detections(0, 0.0, Ok(vec![net(), racquet(0.2, 0.3), ball(0.25, 0.3)]));
        let trigger = effects.angle_request.unwrap();

        let effects = session.on_angle(trigger, Ok(vec![LabelScore::new("closed", 0.9)]));
        assert!(matches!(effects.events[0], SessionEvent::Angle(a) if a.face == RacquetFace::Closed));
        assert_eq!(effects.messages[0].kind(), MessageKind::AngleFeedback);

        session.on_detections(1, 0.033, Ok(vec![net(), ball(0.4, 0.3)]));
        let effects = session.on_detections(2, 0.066, Ok(vec![net(), ball(0.6, 0.3)]));
        assert_eq!(effects.messages[0].angle(), Some("closed"));

        let record = session.finish();
        assert_eq!(record.angle_timestamps[&RacquetFace::Closed], vec![0.0]);
    }

    #[test]
    fn test_proximity_lost_emits_cleared() {
        let mut session = SessionState::new(&config());
        let effects = session.on_detections(0, 0.0, Ok(vec![racquet(0.2, 0.3), ball(0.25, 0.3)]));
        let trigger = effects.angle_request.unwrap();
        session.on_angle(trigger, Ok(vec![LabelScore::new("flat", 0.9)]));
        assert!(session.current_angle().is_some());

        let effects = session.on_detections(1, 0.033, Ok(vec![racquet(0.2, 0.3), ball(0.8, 0.3)]));
        assert!(effects
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::AngleCleared { frame_index: 1 })));
        assert!(session.current_angle().is_none());
    }

    #[test]
    fn test_swing_window_and_impact_marks_shot() {
        let mut session = SessionState::new(&config());
        assert!(session.on_pose(0, Ok(pose(0, 0.9))).swing_request.is_none());
        assert!(session.on_pose(1, Ok(pose(1, 0.9))).swing_request.is_none());
        let window = session.on_pose(2, Ok(pose(2, 0.9))).swing_request.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[2].frame_index, 2);

        let effects = session.on_swing(2, Ok(vec![LabelScore::new("impact", 0.8)]));
        assert!(matches!(
            effects.events[0],
            SessionEvent::Swing {
                shot_in_progress: true,
                ..
            }
        ));
        assert!(session.is_shot_in_progress());
    }

    #[test]
    fn test_late_pose_kept_out_of_window() {
        let mut session = SessionState::new(&config());
        session.on_pose(0, Ok(pose(0, 0.9)));
        assert!(session.on_pose(2, Ok(pose(2, 0.9))).swing_request.is_none());
        // frame 1 finished after frame 2
        assert!(session.on_pose(1, Ok(pose(1, 0.9))).swing_request.is_none());

        let window = session.on_pose(3, Ok(pose(3, 0.9))).swing_request.unwrap();
        let order: Vec<u64> = window.iter().map(|p| p.frame_index).collect();
        assert_eq!(order, vec![0, 2, 3]);

        session.reset();
        session.on_pose(0, Ok(pose(0, 0.9)));
        session.on_pose(1, Ok(pose(1, 0.9)));
        assert!(session.on_pose(2, Ok(pose(2, 0.9))).swing_request.is_some());
    }

    #[test]
    fn test_presence_messages() {
        let mut session = SessionState::new(&config());
        assert!(session.on_pose(0, Ok(pose(0, 0.1))).messages.is_empty());
        let effects = session.on_pose(1, Ok(pose(1, 0.1)));
        assert_eq!(effects.messages[0].kind(), MessageKind::NotInFrame);
        assert!(session.on_pose(2, Ok(pose(2, 0.1))).messages.is_empty());
        let effects = session.on_pose(3, Ok(pose(3, 0.9)));
        assert_eq!(effects.messages[0].kind(), MessageKind::BackInFrame);
    }

    #[test]
    fn test_presence_monitor_reports_once() {
        let mut monitor = PresenceMonitor::new(0.3, 3);
        assert_eq!(monitor.observe(0.1), None);
        assert_eq!(monitor.observe(0.1), None);
        assert_eq!(monitor.observe(0.1), Some(false));
        assert_eq!(monitor.observe(0.1), None);
        assert!(monitor.is_absent());
        assert_eq!(monitor.observe(0.5), Some(true));
        assert_eq!(monitor.observe(0.5), None);
    }

    #[test]
    fn test_reset_clears_counters_and_record() {
        let mut session = SessionState::new(&config());
        session.on_detections(0, 0.0, Ok(vec![net(), ball(0.4, 0.5)]));
        session.on_detections(1, 0.033, Ok(vec![net(), ball(0.6, 0.5)]));
        assert_eq!(session.counters().failed_shots, 1);

        session.set_video_reference("clip-001.mov");
        assert_eq!(session.finish().video_reference.as_deref(), Some("clip-001.mov"));

        session.reset();
        let record = session.finish();
        assert_eq!(record.total_attempts, 0);
        assert!(record.video_reference.is_none());
        assert!(record.angle_timestamps.is_empty());
    }

    #[test]
    fn test_record_json_shape() {
        let session = SessionState::new(&config());
        let json = serde_json::to_value(session.finish()).unwrap();
        assert_eq!(json["totalAttempts"], 0);
        assert!(json.get("videoReference").is_none());
        assert!(json["timestamp"].is_string());
    }
}
