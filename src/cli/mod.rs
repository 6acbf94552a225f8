//! Terminal front-end: argument parsing, table rendering, and the REPL.

pub mod display;
pub mod repl;
pub mod types;

pub use repl::{run, ReplContext};
pub use types::Cli;
