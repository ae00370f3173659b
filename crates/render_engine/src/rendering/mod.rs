//! Command recording operations

pub mod commands;

pub use commands::{CommandPool, CommandRecorder, OneTimeCommands};
