//! Persistence layer modules.
//!
//! Records live as one JSON file each under a state directory; all writes
//! go through [`record_file`]'s atomic replace.

pub mod checkpoint_repo;
pub mod db;
pub mod record_file;
pub mod session_repo;

pub use db::StateDir;
