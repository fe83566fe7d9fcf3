//! Core library for the polar_daq acquisition engine.
//!
//! Runs one camera of a dual-camera imaging polarimeter. The master process drives
//! the rotation stage whose trigger output fires both cameras; the slave process
//! follows through a shared signalling channel. Both write one frame record per
//! exposure.
//!
//! - [`config`]: layered settings and validation
//! - [`plan`]: rotation geometry and frame count
//! - [`hardware`]: device seams, retrying dispatcher and simulated devices
//! - [`instrument`]: camera and rotator controllers
//! - [`sync`]: master/slave signalling
//! - [`data`]: buffer pool, frame metadata and sinks
//! - [`orchestrator`]: per-process observation sequence

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod sync;
