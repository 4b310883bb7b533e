//! Step Execution Module
//!
//! Runs a step through its phases and hands its children to peers.
//!
//! # Architecture
//!
//! - [`engine`]: Phase driver and parallel joins
//! - [`context`]: Per-run state and bounded fan-out
//! - [`dependency`]: Dependency downloads into the run directory
//! - [`capability`]: Capability registry and sandboxed process loader
//! - [`distribution`]: Sending child steps to an engine instance

pub mod capability;
pub mod context;
pub mod dependency;
pub mod distribution;
pub mod engine;

pub use capability::{Capability, CapabilityError, CapabilityLoader, CapabilityRegistry};
pub use distribution::{DistributionError, Distributor, HttpDistributor, LocalDistributor};
pub use engine::{Engine, EngineError};
