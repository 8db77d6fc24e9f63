//! Shared utility functions.
//!
//! Command-line tokenising and quoting for app invocations, and directory
//! tree copies used when staging inputs and harvesting derivatives.

pub mod fs;
pub mod shell;

pub use fs::copy_tree;
pub use shell::{shell_join, shell_quote, split_command_line};
