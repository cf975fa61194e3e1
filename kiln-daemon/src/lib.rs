//! Kiln daemon library
//!
//! This module exports the internal components of the daemon for testing purposes.

pub mod commands;
pub mod config;
pub mod logging;
pub mod watch;
