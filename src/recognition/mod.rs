//! Recognition model seams. The core treats every model as an opaque
//! `frame -> async result` function; concrete backends live in submodules.

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod replay;

use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::detection::DetectedObject;
use crate::error::RecognitionError;
use crate::frame::Frame;
use crate::pose::PoseKeypointSet;

pub type RecognitionResult<T> = Result<T, RecognitionError>;

/// One entry of a ranked label distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub confidence: f32,
}

impl LabelScore {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Highest-confidence entry. Does not rely on the model returning a sorted list.
pub fn top_label(scores: &[LabelScore]) -> Option<&LabelScore> {
    scores.iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(Ordering::Equal)
    })
}

/// Per-frame body pose estimation.
pub trait PoseEstimator: Send + Sync {
    fn estimate(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<PoseKeypointSet>>;
}

/// Swing-phase classification over a full pose window (oldest sample first).
pub trait SwingModel: Send + Sync {
    fn classify(
        &self,
        window: Vec<PoseKeypointSet>,
    ) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>>;
}

/// Ball / net / racquet detection.
pub trait ObjectModel: Send + Sync {
    fn detect(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<DetectedObject>>>;
}

/// Racquet-face angle classification of a single frame.
pub trait AngleModel: Send + Sync {
    fn classify(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>>;
}

/// The set of recognition backends a pipeline runs with.
#[derive(Clone)]
pub struct Models {
    pub pose: Arc<dyn PoseEstimator>,
    pub swing: Arc<dyn SwingModel>,
    pub objects: Arc<dyn ObjectModel>,
    pub angle: Arc<dyn AngleModel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_label_unsorted() {
        let scores = vec![
            LabelScore::new("backswing", 0.2),
            LabelScore::new("impact", 0.7),
            LabelScore::new("follow_through", 0.1),
        ];
        assert_eq!(top_label(&scores).unwrap().label, "impact");
    }

    #[test]
    fn test_top_label_empty() {
        assert!(top_label(&[]).is_none());
    }
}
