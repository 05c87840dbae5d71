pub mod config;
pub mod dataplane;
pub mod face;
pub mod fwd;
pub mod input;
pub mod latency;
pub mod output;
pub mod ring;
pub mod strategy;

pub use config::Config;
pub use dataplane::{DataPlane, DataPlaneCounters, DataPlaneState};
pub use face::{Face, FaceDriver, FaceTable};
