pub mod config;
pub mod service;
pub mod stats;

pub use config::ServiceConfig;
pub use service::{CameraBackend, CameraService, CapturedFrame, ImageFrame, PowerState};
pub use stats::FrameStats;
