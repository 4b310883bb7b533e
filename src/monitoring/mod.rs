//! Step Monitoring Module
//!
//! Reports step progress to the run's remote log sink.
//!
//! # Components
//!
//! - [`StepLog`]: Per-run client posting formatted status lines

pub mod log_sink;

pub use log_sink::{format_message, StepLog, HOST_NAME, LOG_ROUTE};
