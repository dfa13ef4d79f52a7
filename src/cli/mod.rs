//! CLI module for gary4local
//!
//! Argument parsing, terminal rendering and the interactive control prompt.

pub mod args;
pub mod control;
pub mod display;

pub use args::{Args, Commands};
pub use display::ProgressBarSink;
