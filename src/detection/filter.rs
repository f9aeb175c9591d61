use std::cmp::Ordering;

use tracing::debug;

use crate::config::DetectionConfig;

use super::{DetectedObject, ObjectLabel};

/// Accepted detections of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredDetections {
    pub ball: Option<DetectedObject>,
    pub net: Option<DetectedObject>,
    pub racquet: Option<DetectedObject>,
    /// Everything that passed filtering, for display
    pub all: Vec<DetectedObject>,
}

/// EMA of the accepted ball bounding-box area
struct SizeEma {
    alpha: f32,
    value: Option<f32>,
}

impl SizeEma {
    fn new(alpha: f32) -> Self {
        Self { alpha, value: None }
    }

    fn update(&mut self, area: f32) {
        self.value = Some(match self.value {
            Some(prev) => self.alpha * area + (1.0 - self.alpha) * prev,
            None => area,
        });
    }

    fn reset(&mut self) {
        self.value = None;
    }
}

/// Confidence and ball-size-consistency filter over raw model detections.
pub struct ObjectFilter {
    ball_threshold: f32,
    net_threshold: f32,
    racquet_threshold: f32,
    min_ratio: f32,
    max_ratio: f32,
    reset_after: u32,
    ball_size: SizeEma,
    reject_streak: u32,
}

impl ObjectFilter {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            ball_threshold: config.ball_threshold,
            net_threshold: config.net_threshold,
            racquet_threshold: config.racquet_threshold,
            min_ratio: config.size_min_ratio,
            max_ratio: config.size_max_ratio,
            reset_after: config.size_reset_after,
            ball_size: SizeEma::new(config.size_ema_alpha),
            reject_streak: 0,
        }
    }

    fn threshold(&self, label: ObjectLabel) -> f32 {
        match label {
            ObjectLabel::Ball => self.ball_threshold,
            ObjectLabel::Net => self.net_threshold,
            ObjectLabel::Racquet => self.racquet_threshold,
        }
    }

    pub fn ball_size_estimate(&self) -> Option<f32> {
        self.ball_size.value
    }

    fn size_consistent(&self, area: f32) -> bool {
        match self.ball_size.value {
            Some(expected) if expected > 0.0 => {
                let ratio = area / expected;
                ratio >= self.min_ratio && ratio <= self.max_ratio
            }
            _ => true,
        }
    }

    pub fn apply(&mut self, candidates: &[DetectedObject]) -> FilteredDetections {
        let mut confident: Vec<DetectedObject> = candidates
            .iter()
            .filter(|d| d.confidence > self.threshold(d.label))
            .copied()
            .collect();
        confident.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

        let mut out = FilteredDetections::default();
        let mut ball_candidates = 0usize;
        for det in confident {
            match det.label {
                ObjectLabel::Ball => {
                    ball_candidates += 1;
                    let area = det.bbox.area();
                    if !self.size_consistent(area) {
                        debug!(
                            area,
                            expected = self.ball_size.value.unwrap_or_default(),
                            "ball rejected by size check"
                        );
                        continue;
                    }
                    if out.ball.is_none() {
                        out.ball = Some(det);
                    }
                    out.all.push(det);
                }
                ObjectLabel::Net => {
                    if out.net.is_none() {
                        out.net = Some(det);
                    }
                    out.all.push(det);
                }
                ObjectLabel::Racquet => {
                    if out.racquet.is_none() {
                        out.racquet = Some(det);
                    }
                    out.all.push(det);
                }
            }
        }

        match out.ball {
            Some(ball) => {
                self.ball_size.update(ball.bbox.area());
                self.reject_streak = 0;
            }
            None if ball_candidates > 0 => {
                self.reject_streak += 1;
                if self.reject_streak >= self.reset_after {
                    debug!(streak = self.reject_streak, "ball size reject streak, re-seeding size estimate");
                    self.ball_size.reset();
                    self.reject_streak = 0;
                }
            }
            None => {}
        }

        out
    }

    pub fn reset(&mut self) {
        self.ball_size.reset();
        self.reject_streak = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::NormRect;

    fn det(label: ObjectLabel, confidence: f32, side: f32) -> DetectedObject {
        DetectedObject::new(label, confidence, NormRect::new(0.5, 0.5, side, side))
    }

    fn filter() -> ObjectFilter {
        ObjectFilter::from_config(&DetectionConfig::default())
    }

    #[test]
    fn test_threshold_and_best_per_label() {
        let mut f = filter();
        let out = f.apply(&[
            det(ObjectLabel::Net, 0.4, 0.3),
            det(ObjectLabel::Net, 0.7, 0.3),
            det(ObjectLabel::Net, 0.9, 0.2),
            det(ObjectLabel::Racquet, 0.3, 0.1),
        ]);
        assert_eq!(out.net.unwrap().confidence, 0.9);
        assert!(out.racquet.is_none());
        assert_eq!(out.all.len(), 2);
    }

    #[test]
    fn test_first_ball_seeds_size() {
        let mut f = filter();
        let out = f.apply(&[det(ObjectLabel::Ball, 0.8, 0.1)]);
        assert!(out.ball.is_some());
        assert!((f.ball_size_estimate().unwrap() - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_size_outlier_rejected() {
        let mut f = filter();
        f.apply(&[det(ObjectLabel::Ball, 0.8, 0.1)]);
        // 4x area
        let out = f.apply(&[det(ObjectLabel::Ball, 0.95, 0.2)]);
        assert!(out.ball.is_none());
        assert!(out.all.is_empty());
        // estimate unchanged by the rejected detection
        assert!((f.ball_size_estimate().unwrap() - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_falls_back_to_size_consistent_lower_confidence_ball() {
        let mut f = filter();
        f.apply(&[det(ObjectLabel::Ball, 0.8, 0.1)]);
        let out = f.apply(&[det(ObjectLabel::Ball, 0.95, 0.3), det(ObjectLabel::Ball, 0.6, 0.11)]);
        assert_eq!(out.ball.unwrap().confidence, 0.6);
    }

    #[test]
    fn test_ema_update() {
        let mut f = filter();
        f.apply(&[det(ObjectLabel::Ball, 0.8, 0.1)]);
        // area 0.0144 within [0.5x, 2x] of 0.01
        f.apply(&[det(ObjectLabel::Ball, 0.8, 0.12)]);
        let expected = 0.1 * 0.0144 + 0.9 * 0.01;
        assert!((f.ball_size_estimate().unwrap() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_reject_streak_reseeds() {
        let mut config = DetectionConfig::default();
        config.size_reset_after = 3;
        let mut f = ObjectFilter::from_config(&config);
        f.apply(&[det(ObjectLabel::Ball, 0.8, 0.1)]);
        for _ in 0..3 {
            assert!(f.apply(&[det(ObjectLabel::Ball, 0.8, 0.3)]).ball.is_none());
        }
        assert!(f.ball_size_estimate().is_none());
        assert!(f.apply(&[det(ObjectLabel::Ball, 0.8, 0.3)]).ball.is_some());
    }
}
