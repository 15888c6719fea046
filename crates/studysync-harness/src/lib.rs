//! Deterministic test harness for the room synchronization client.
//!
//! Provides an in-memory [`MemoryBackend`] implementing every backend
//! capability (rows, change feed, pub/sub, blobs) with fault injection,
//! and a [`SimEnv`] whose monotonic clock follows tokio's virtual time so
//! scenario tests run instantly under a paused runtime clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod memory;
pub mod sim_env;

pub use memory::MemoryBackend;
pub use sim_env::SimEnv;
