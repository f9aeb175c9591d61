use serde::{Deserialize, Serialize};

/// COCO keypoint order, as emitted by MoveNet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "(f32, f32, f32)", into = "(f32, f32, f32)")]
pub struct Keypoint {
    /// Normalized, 0 at the left edge
    pub x: f32,
    /// Normalized, 0 at the top edge
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

impl From<(f32, f32, f32)> for Keypoint {
    fn from((x, y, confidence): (f32, f32, f32)) -> Self {
        Self::new(x, y, confidence)
    }
}

impl From<Keypoint> for (f32, f32, f32) {
    fn from(kp: Keypoint) -> Self {
        (kp.x, kp.y, kp.confidence)
    }
}

/// One frame's worth of pose keypoints, in `KeypointIndex` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseKeypointSet {
    pub frame_index: u64,
    pub keypoints: [Keypoint; KeypointIndex::COUNT],
}

impl PoseKeypointSet {
    pub fn new(frame_index: u64, keypoints: [Keypoint; KeypointIndex::COUNT]) -> Self {
        Self {
            frame_index,
            keypoints,
        }
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.keypoints[index as usize]
    }

    /// Mean confidence over all keypoints, used for presence
    pub fn average_confidence(&self) -> f32 {
        let sum: f32 = self.keypoints.iter().map(|k| k.confidence).sum();
        sum / KeypointIndex::COUNT as f32
    }

    /// Flattened `[x0, y0, c0, x1, y1, c1, ...]`, the per-sample layout of the
    /// swing-phase model input.
    pub fn to_features(&self) -> [f32; KeypointIndex::COUNT * 3] {
        let mut features = [0.0; KeypointIndex::COUNT * 3];
        for (i, kp) in self.keypoints.iter().enumerate() {
            features[i * 3] = kp.x;
            features[i * 3 + 1] = kp.y;
            features[i * 3 + 2] = kp.confidence;
        }
        features
    }
}

impl Default for PoseKeypointSet {
    fn default() -> Self {
        Self {
            frame_index: 0,
            keypoints: [Keypoint::default(); KeypointIndex::COUNT],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_get_and_average() {
        let mut keypoints = [Keypoint::new(0.0, 0.0, 0.5); KeypointIndex::COUNT];
        keypoints[KeypointIndex::RightWrist as usize] = Keypoint::new(0.7, 0.4, 0.5);
        let pose = PoseKeypointSet::new(3, keypoints);
        assert_eq!(pose.get(KeypointIndex::RightWrist).x, 0.7);
        assert!((pose.average_confidence() - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_features_layout() {
        let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
        keypoints[1] = Keypoint::new(0.1, 0.2, 0.3);
        let features = PoseKeypointSet::new(0, keypoints).to_features();
        assert_eq!(features.len(), 51);
        assert_eq!(&features[3..6], &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_keypoint_deserializes_from_triple() {
        let kp: Keypoint = serde_json::from_str("[0.25, 0.5, 0.9]").unwrap();
        assert_eq!(kp, Keypoint::new(0.25, 0.5, 0.9));
    }
}
