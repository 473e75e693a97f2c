//! Command safety classification and sudo policy.

pub mod classifier;

pub use classifier::{classify_command, CommandClass, SudoMethod, SudoPolicy};
