pub mod keypoint;
pub mod swing;
pub mod window;

pub use keypoint::{Keypoint, KeypointIndex, PoseKeypointSet};
pub use swing::{SwingPhaseClassifier, SwingResult};
pub use window::PoseWindow;
