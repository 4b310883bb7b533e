//! StepRunner - Distributed Workflow Step Engine
//!
//! Executes a tree of workflow steps. Each step prepares a run directory,
//! downloads its dependencies, runs its capability and then hands its
//! children to peer engine instances, joining on their results.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Step tree model, validation and step files
//! - [`execution`]: Phase engine, capabilities, dependencies and distribution
//! - [`monitoring`]: Remote step log
//! - [`notification`]: Batched status notifications
//! - [`server`]: HTTP surface of a peer
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use steprunner::config::EngineConfig;
//! use steprunner::execution::Engine;
//! use steprunner::load_step;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a step tree from YAML
//!     let step = load_step("nightly.yaml")?;
//!
//!     // Create engine
//!     let engine = Engine::new(&EngineConfig::default())?;
//!
//!     // Validate and execute the tree
//!     let result = engine.submit(step).await?;
//!     assert!(result.is_complete());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod execution;
pub mod monitoring;
pub mod notification;
pub mod server;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use execution::engine::Engine;
pub use workflow::model::{Step, StepStatus};
pub use workflow::parser::{load_step, save_step};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "StepRunner";
