//! Workfarm - autonomous agent goal orchestration.
//!
//! Operators declare high-level goals for named agents. The engine
//! reconnoiters the target working tree, asks an oracle model for a
//! structured plan, dispatches each plan step to a tool-equipped worker
//! subprocess, evaluates the worker's output, refines the remainder of
//! the plan after each success, and escalates to the operator only when
//! it cannot answer a worker's question on its own.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
