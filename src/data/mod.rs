//! Image buffers, per-frame metadata and frame sinks.

pub mod buffer_pool;
pub mod metadata;
pub mod storage;
