//! Scripted recognition backend: replays recorded model outputs from JSON.
//!
//! ```json
//! { "frames": [
//!   { "index": 0, "t": 0.0,
//!     "objects": [{ "label": "net", "confidence": 0.9,
//!                   "bbox": { "x": 0.45, "y": 0.4, "width": 0.1, "height": 0.2 } }],
//!     "pose": [[0.5, 0.2, 0.9], ...17 entries],
//!     "swing": [{ "label": "impact", "confidence": 0.8 }],
//!     "angle": [{ "label": "flat", "confidence": 0.7 }] }
//! ] }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde::Deserialize;

use crate::detection::DetectedObject;
use crate::error::RecognitionError;
use crate::frame::Frame;
use crate::pose::{Keypoint, KeypointIndex, PoseKeypointSet};

use super::{AngleModel, LabelScore, Models, ObjectModel, PoseEstimator, RecognitionResult, SwingModel};

const IDLE_LABEL: &str = "idle";

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFrame {
    pub index: u64,
    /// Capture time in seconds
    #[serde(rename = "t")]
    pub timestamp: f64,
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
    #[serde(default)]
    pub pose: Option<Vec<Keypoint>>,
    /// Swing-phase output for the window ending at this frame
    #[serde(default)]
    pub swing: Option<Vec<LabelScore>>,
    #[serde(default)]
    pub angle: Option<Vec<LabelScore>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayScript {
    pub frames: Vec<ScriptFrame>,
}

impl ReplayScript {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let script: ReplayScript = serde_json::from_str(json)?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        let mut last: Option<(u64, f64)> = None;
        for frame in &self.frames {
            if let Some((index, t)) = last {
                if frame.index <= index || frame.timestamp < t {
                    bail!("frame {} is out of order", frame.index);
                }
            }
            if let Some(pose) = &frame.pose {
                if pose.len() != KeypointIndex::COUNT {
                    bail!(
                        "frame {}: pose has {} keypoints, expected {}",
                        frame.index,
                        pose.len(),
                        KeypointIndex::COUNT
                    );
                }
            }
            last = Some((frame.index, frame.timestamp));
        }
        Ok(())
    }

    /// Pixel-less frames in capture order.
    pub fn frames(&self) -> Vec<Frame> {
        self.frames
            .iter()
            .map(|f| Frame::empty(f.index, Duration::from_secs_f64(f.timestamp.max(0.0))))
            .collect()
    }

    pub fn models(&self) -> Models {
        ReplayModels::new(self).into_models()
    }
}

/// Implements every model trait by looking results up by frame index.
#[derive(Clone, Default)]
pub struct ReplayModels {
    frames: Arc<HashMap<u64, ScriptFrame>>,
}

impl ReplayModels {
    pub fn new(script: &ReplayScript) -> Self {
        let frames = script.frames.iter().map(|f| (f.index, f.clone())).collect();
        Self {
            frames: Arc::new(frames),
        }
    }

    pub fn into_models(self) -> Models {
        let shared = Arc::new(self);
        Models {
            pose: shared.clone(),
            swing: shared.clone(),
            objects: shared.clone(),
            angle: shared,
        }
    }

    fn pose_for(&self, index: u64) -> RecognitionResult<PoseKeypointSet> {
        let keypoints = self
            .frames
            .get(&index)
            .and_then(|f| f.pose.clone())
            .ok_or_else(|| RecognitionError::output("pose", format!("no pose recorded for frame {index}")))?;
        let keypoints: [Keypoint; KeypointIndex::COUNT] = keypoints
            .try_into()
            .map_err(|v: Vec<Keypoint>| RecognitionError::output("pose", format!("{} keypoints", v.len())))?;
        Ok(PoseKeypointSet::new(index, keypoints))
    }
}

impl PoseEstimator for ReplayModels {
    fn estimate(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<PoseKeypointSet>> {
        future::ready(self.pose_for(frame.index)).boxed()
    }
}

impl SwingModel for ReplayModels {
    fn classify(&self, window: Vec<PoseKeypointSet>) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>> {
        let scores = window
            .last()
            .and_then(|last| self.frames.get(&last.frame_index))
            .and_then(|f| f.swing.clone())
            .unwrap_or_else(|| vec![LabelScore::new(IDLE_LABEL, 1.0)]);
        future::ready(Ok(scores)).boxed()
    }
}

impl ObjectModel for ReplayModels {
    fn detect(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<DetectedObject>>> {
        let objects = self
            .frames
            .get(&frame.index)
            .map(|f| f.objects.clone())
            .unwrap_or_default();
        future::ready(Ok(objects)).boxed()
    }
}

impl AngleModel for ReplayModels {
    fn classify(&self, frame: Frame) -> BoxFuture<'static, RecognitionResult<Vec<LabelScore>>> {
        let result = self
            .frames
            .get(&frame.index)
            .and_then(|f| f.angle.clone())
            .ok_or_else(|| {
                RecognitionError::output("angle", format!("no angle recorded for frame {}", frame.index))
            });
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ObjectLabel;

    const SCRIPT: &str = r#"{ "frames": [
        { "index": 0, "t": 0.0,
          "objects": [{ "label": "ball", "confidence": 0.8,
                        "bbox": { "x": 0.3, "y": 0.3, "width": 0.02, "height": 0.02 } }],
          "angle": [{ "label": "open", "confidence": 0.6 }] },
        { "index": 1, "t": 0.033 }
    ] }"#;

    #[test]
    fn test_parse_and_frames() {
        let script = ReplayScript::from_json(SCRIPT).unwrap();
        let frames = script.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[1].timestamp, Duration::from_secs_f64(0.033));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let json = r#"{ "frames": [ { "index": 2, "t": 0.1 }, { "index": 1, "t": 0.2 } ] }"#;
        assert!(ReplayScript::from_json(json).is_err());
    }

    #[test]
    fn test_wrong_keypoint_count_rejected() {
        let json = r#"{ "frames": [ { "index": 0, "t": 0.0, "pose": [[0.1, 0.2, 0.9]] } ] }"#;
        assert!(ReplayScript::from_json(json).is_err());
    }

    #[tokio::test]
    async fn test_models_replay_recorded_output() {
        let models = ReplayScript::from_json(SCRIPT).unwrap().models();
        let frame = Frame::empty(0, Duration::ZERO);

        let objects = models.objects.detect(frame.clone()).await.unwrap();
        assert_eq!(objects[0].label, ObjectLabel::Ball);

        let angle = models.angle.classify(frame.clone()).await.unwrap();
        assert_eq!(angle[0].label, "open");

        // nothing recorded
        assert!(models.pose.estimate(frame).await.is_err());
        let empty = models.objects.detect(Frame::empty(1, Duration::ZERO)).await.unwrap();
        assert!(empty.is_empty());
        let swing = models.swing.classify(vec![PoseKeypointSet::default()]).await.unwrap();
        assert_eq!(swing[0].label, IDLE_LABEL);
    }
}
