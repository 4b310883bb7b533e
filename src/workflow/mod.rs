//! Step Tree Module
//!
//! Provides the step tree data model, its validation rules, and loading
//! from files.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, StepStatus)
//! - [`validator`]: Structural checks and endpoint inheritance
//! - [`parser`]: YAML/JSON loading and saving

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{CapabilityRef, Step, StepStatus};
pub use parser::{load_step, save_step, ParseError};
pub use validator::{validate, ValidationError};
