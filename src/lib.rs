pub mod angle;
pub mod companion;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod pipeline;
pub mod pose;
pub mod recognition;
pub mod scoring;
pub mod session;
pub mod tracker;
