//! Infrastructure: configuration, logging, persistence, and the
//! subprocess-backed oracle and worker runtime.

pub mod config;
pub mod logging;
pub mod store;
pub mod worker;
