//! Domain model module declarations.

pub mod checkpoint;
pub mod recovery;
pub mod session;
