//! Session lifecycle supervision.
//!
//! Covers process liveness probing, the heartbeat protocol, the stale
//! session reaper, checkpointing, and the retry/recovery engine.

pub mod checkpoint_manager;
pub mod heartbeat;
pub mod liveness;
pub mod reaper;
pub mod recovery;
pub mod session_manager;
pub mod staged_task;
