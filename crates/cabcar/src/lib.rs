//! cabcar - the train-side agent of the teleoperation fabric.
//!
//! Owns one encoder facade and one video source, fragments every encoded
//! frame into MTU-bounded packets, paces them onto the currently selected
//! transport, and answers console commands: speed, direction, power, video
//! quality, protocol switching and clock synchronisation.

pub mod agent;
pub mod clock;
pub mod encoder;
pub mod motor;
pub mod netspeed;
pub mod pacer;
pub mod source;
pub mod telemetry;
pub mod transport;

pub use agent::{AgentConfig, AgentState, TrainAgent};
