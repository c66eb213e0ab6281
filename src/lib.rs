#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use errors::{AppError, Result};
pub use supervisor::Supervisor;
