//! Device seams of the acquisition engine.
//!
//! Controllers never talk to a vendor library or serial port directly. The camera
//! goes through [`CameraSdk`] and the rotation stage through [`GcsLink`], so the
//! same controller code runs against real devices and against the simulations in
//! [`crate::hardware::mock`].

use crate::data::buffer_pool::BufferPool;
use crate::hardware::operation::{HardwareOperation, OpValue};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Camera library binding.
///
/// Methods return the raw vendor code on failure. Classification and retries are
/// the dispatcher's job.
#[async_trait]
pub trait CameraSdk: Send {
    /// Initialise the device and utility libraries.
    async fn initialise_libraries(&mut self) -> Result<(), i32>;

    /// Release the device and utility libraries.
    async fn finalise_libraries(&mut self) -> Result<(), i32>;

    /// Perform exactly one vendor call.
    async fn execute(&mut self, op: &HardwareOperation) -> Result<OpValue, i32>;

    /// Queue pool slot `slot` (of `len` bytes) for the device to fill.
    ///
    /// A native binding registers the slot's address with the library here; buffers
    /// are filled in the order they were queued.
    async fn queue_buffer(&mut self, slot: usize, len: usize) -> Result<(), i32>;

    /// Block until the oldest queued buffer is filled, returning its slot.
    ///
    /// Fails with the vendor timeout code if nothing arrives within `timeout`.
    async fn wait_buffer(&mut self, pool: &mut BufferPool, timeout: Duration)
        -> Result<usize, i32>;
}

/// Line-oriented command channel to a PI GCS motion controller.
#[async_trait]
pub trait GcsLink: Send {
    /// Open the channel. May fail on the first attempt after a controller reboot.
    async fn connect(&mut self) -> Result<()>;

    /// Send a command that produces no reply, e.g. `MOV 1 45.0`.
    async fn command(&mut self, cmd: &str) -> Result<()>;

    /// Send a query and return its reply line, e.g. `POS? 1` -> `1=45.0012`.
    async fn query(&mut self, cmd: &str) -> Result<String>;
}
