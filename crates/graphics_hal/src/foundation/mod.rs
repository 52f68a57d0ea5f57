//! Foundation module - shared utilities
//!
//! - Logging setup and re-exported log macros
//! - Handle-based collections used by the command-list tracker
//! - Poison-recovering lock helpers

pub mod collections;
pub mod logging;
pub mod sync;
