//! Ports: async traits the service layer depends on.
//!
//! Implementations live under `infrastructure`; tests substitute mocks.

pub mod oracle;
pub mod store;
pub mod worker;

pub use oracle::{Oracle, OracleReply};
pub use store::{LogRange, StateStore, StoreError, StoreResult};
pub use worker::{WorkerError, WorkerEvent, WorkerLaunch, WorkerRuntime, WorkerStreamEvent};
