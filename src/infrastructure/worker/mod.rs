//! Subprocess-backed worker runtime and oracle.

pub mod command;
pub mod oracle;
pub mod runtime;

pub use oracle::SubprocessOracle;
pub use runtime::ProcessWorkerRuntime;
