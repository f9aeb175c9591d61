pub mod ball;
pub mod net;
pub mod velocity;

pub use ball::{BallPosition, BallState, BallTracker, TrackerUpdate};
pub use net::NetBoxEstimator;
pub use velocity::VelocitySmoother;
