//! Shared utilities

pub mod port;
pub mod time;
