use std::collections::VecDeque;

use tracing::debug;

use crate::config::TrackerConfig;
use crate::geometry::{NormRect, Point};

use super::net::NetBoxEstimator;
use super::velocity::VelocitySmoother;

/// One sample of the ball trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BallPosition {
    pub center: Point,
    /// Seconds since capture start
    pub timestamp: f64,
    pub frame_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallState {
    Unknown,
    Detected,
    ApproachingNet,
    CrossingNet,
    CrossedNet,
    Lost,
}

impl BallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BallState::Unknown => "unknown",
            BallState::Detected => "detected",
            BallState::ApproachingNet => "approaching_net",
            BallState::CrossingNet => "crossing_net",
            BallState::CrossedNet => "crossed_net",
            BallState::Lost => "lost",
        }
    }
}

/// What changed on one `observe` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerUpdate {
    pub state: BallState,
    /// A ball sample was appended this frame
    pub accepted: bool,
    /// The ball was just declared lost while a crossing was in progress.
    /// Reported once per episode.
    pub lost_during_crossing: bool,
}

/// Owns the ball trajectory, smoothed velocity, net box and crossing flag.
pub struct BallTracker {
    trajectory_len: usize,
    approach_distance: f32,
    crossing_distance: f32,
    crossed_distance: f32,
    lost_timeout: f64,
    trajectory: VecDeque<BallPosition>,
    velocity: VelocitySmoother,
    net: NetBoxEstimator,
    state: BallState,
    crossing_in_progress: bool,
    lost_reported: bool,
}

impl BallTracker {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            trajectory_len: config.trajectory_len.max(2),
            approach_distance: config.approach_distance,
            crossing_distance: config.crossing_distance,
            crossed_distance: config.crossed_distance,
            lost_timeout: config.lost_timeout_secs,
            trajectory: VecDeque::with_capacity(config.trajectory_len),
            velocity: VelocitySmoother::new(config.velocity_window, config.velocity_alpha),
            net: NetBoxEstimator::from_config(config),
            state: BallState::Unknown,
            crossing_in_progress: false,
            lost_reported: false,
        }
    }

    /// Feed one frame's accepted ball and net boxes.
    pub fn observe(
        &mut self,
        frame_index: u64,
        timestamp: f64,
        ball: Option<NormRect>,
        net: Option<NormRect>,
    ) -> TrackerUpdate {
        self.net.observe(net);

        let Some(ball) = ball else {
            return self.observe_missing(timestamp);
        };

        let sample = BallPosition {
            center: ball.center(),
            timestamp,
            frame_index,
        };
        if let Some(prev) = self.trajectory.back() {
            self.velocity
                .push(prev.center, prev.timestamp, sample.center, sample.timestamp);
        }
        self.trajectory.push_back(sample);
        while self.trajectory.len() > self.trajectory_len {
            self.trajectory.pop_front();
        }
        self.lost_reported = false;

        let next = self.classify_state(sample.center);
        if next != self.state {
            debug!(frame_index, from = self.state.as_str(), to = next.as_str(), "ball state");
        }
        self.state = next;
        if matches!(next, BallState::ApproachingNet | BallState::CrossingNet) {
            self.crossing_in_progress = true;
        }

        TrackerUpdate {
            state: self.state,
            accepted: true,
            lost_during_crossing: false,
        }
    }

    fn observe_missing(&mut self, timestamp: f64) -> TrackerUpdate {
        let mut lost_during_crossing = false;
        if let Some(last) = self.trajectory.back() {
            if timestamp - last.timestamp > self.lost_timeout && self.state != BallState::Lost {
                debug!(
                    last_frame = last.frame_index,
                    crossing = self.crossing_in_progress,
                    "ball lost"
                );
                self.state = BallState::Lost;
                if self.crossing_in_progress && !self.lost_reported {
                    lost_during_crossing = true;
                    self.lost_reported = true;
                }
            }
        }
        TrackerUpdate {
            state: self.state,
            accepted: false,
            lost_during_crossing,
        }
    }

    fn classify_state(&self, center: Point) -> BallState {
        let Some(net) = self.net.net_box() else {
            return BallState::Detected;
        };
        let net_x = net.center().x;
        let offset = center.x - net_x;
        let distance = offset.abs();
        let vx = self.velocity.velocity().x;
        let toward_net = vx != 0.0 && vx.signum() == (net_x - center.x).signum();

        if offset > self.crossed_distance {
            BallState::CrossedNet
        } else if distance < self.crossing_distance {
            BallState::CrossingNet
        } else if distance < self.approach_distance && toward_net {
            BallState::ApproachingNet
        } else {
            BallState::Detected
        }
    }

    pub fn state(&self) -> BallState {
        self.state
    }

    pub fn velocity(&self) -> Point {
        self.velocity.velocity()
    }

    pub fn net_box(&self) -> Option<NormRect> {
        self.net.net_box()
    }

    pub fn is_crossing_in_progress(&self) -> bool {
        self.crossing_in_progress
    }

    pub fn trajectory(&self) -> impl Iterator<Item = &BallPosition> {
        self.trajectory.iter()
    }

    pub fn trajectory_len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn latest(&self) -> Option<&BallPosition> {
        self.trajectory.back()
    }

    /// Sample before the latest one
    pub fn previous(&self) -> Option<&BallPosition> {
        let n = self.trajectory.len();
        if n < 2 {
            None
        } else {
            self.trajectory.get(n - 2)
        }
    }

    /// Net displacement across the retained trajectory is left-to-right.
    pub fn is_moving_forward(&self) -> bool {
        match (self.trajectory.front(), self.trajectory.back()) {
            (Some(first), Some(last)) if self.trajectory.len() >= 2 => last.center.x > first.center.x,
            _ => false,
        }
    }

    /// Ball height where the last known trajectory meets `x`, extrapolated along
    /// the smoothed velocity. `None` without a usable horizontal velocity.
    pub fn extrapolate_height_at(&self, x: f32) -> Option<f32> {
        let last = self.trajectory.back()?;
        let v = self.velocity.velocity();
        if v.x.abs() < f32::EPSILON {
            return None;
        }
        let dt = (x - last.center.x) / v.x;
        if dt < 0.0 {
            return Some(last.center.y);
        }
        Some(last.center.y + v.y * dt)
    }

    /// Clears trajectory, velocity history, net box and the crossing flag.
    pub fn reset_all_tracking(&mut self) {
        self.trajectory.clear();
        self.velocity.reset();
        self.net.reset();
        self.state = BallState::Unknown;
        self.crossing_in_progress = false;
        self.lost_reported = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> BallTracker {
        BallTracker::from_config(&TrackerConfig::default())
    }

    fn ball(x: f32, y: f32) -> Option<NormRect> {
        Some(NormRect::new(x - 0.01, y - 0.01, 0.02, 0.02))
    }

    fn net() -> Option<NormRect> {
        Some(NormRect::from_edges(0.45, 0.4, 0.55, 0.6))
    }

    #[test]
    fn test_trajectory_bounded_fifo() {
        let mut t = tracker();
        for i in 0..25u64 {
            t.observe(i, i as f64 * 0.033, ball(0.01 * i as f32, 0.3), None);
            assert!(t.trajectory_len() <= 10);
        }
        let first = t.trajectory().next().unwrap();
        assert_eq!(first.frame_index, 15);
        assert_eq!(t.latest().unwrap().frame_index, 24);
    }

    #[test]
    fn test_detected_without_net() {
        let mut t = tracker();
        let update = t.observe(0, 0.0, ball(0.3, 0.3), None);
        assert!(update.accepted);
        assert_eq!(update.state, BallState::Detected);
    }

    #[test]
    fn test_state_progression_toward_net() {
        let mut t = tracker();
        assert_eq!(t.observe(0, 0.0, ball(0.2, 0.3), net()).state, BallState::Detected);
        assert_eq!(t.observe(1, 0.1, ball(0.38, 0.3), net()).state, BallState::ApproachingNet);
        assert!(t.is_crossing_in_progress());
        assert_eq!(t.observe(2, 0.2, ball(0.48, 0.3), net()).state, BallState::CrossingNet);
        assert_eq!(t.observe(3, 0.3, ball(0.65, 0.3), net()).state, BallState::CrossedNet);
    }

    #[test]
    fn test_moving_away_is_not_approaching() {
        let mut t = tracker();
        t.observe(0, 0.0, ball(0.4, 0.3), net());
        let update = t.observe(1, 0.1, ball(0.38, 0.3), net());
        assert_eq!(update.state, BallState::Detected);
    }

    #[test]
    fn test_lost_after_timeout_reports_crossing_once() {
        let mut t = tracker();
        t.observe(0, 0.0, ball(0.3, 0.3), net());
        t.observe(1, 0.1, ball(0.4, 0.3), net());
        assert!(t.is_crossing_in_progress());

        let update = t.observe(2, 0.5, None, net());
        assert_eq!(update.state, BallState::ApproachingNet);
        assert!(!update.lost_during_crossing);

        let update = t.observe(3, 1.2, None, net());
        assert_eq!(update.state, BallState::Lost);
        assert!(update.lost_during_crossing);

        let update = t.observe(4, 1.5, None, net());
        assert!(!update.lost_during_crossing);
    }

    #[test]
    fn test_extrapolate_height() {
        let mut t = tracker();
        t.observe(0, 0.0, ball(0.2, 0.5), None);
        t.observe(1, 0.1, ball(0.3, 0.4), None);
        // vx = 1.0, vy = -1.0 → at x = 0.45: 0.4 - 0.15
        let h = t.extrapolate_height_at(0.45).unwrap();
        assert!((h - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_reset_all_tracking() {
        let mut t = tracker();
        t.observe(0, 0.0, ball(0.3, 0.3), net());
        t.observe(1, 0.1, ball(0.4, 0.3), net());
        t.reset_all_tracking();
        assert_eq!(t.trajectory_len(), 0);
        assert_eq!(t.state(), BallState::Unknown);
        assert!(t.net_box().is_none());
        assert!(!t.is_crossing_in_progress());
        assert_eq!(t.velocity(), Point::default());
    }

    #[test]
    fn test_moving_forward() {
        let mut t = tracker();
        t.observe(0, 0.0, ball(0.3, 0.3), None);
        assert!(!t.is_moving_forward());
        t.observe(1, 0.1, ball(0.35, 0.3), None);
        assert!(t.is_moving_forward());
    }
}
