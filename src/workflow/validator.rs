//! Step Tree Validation
//!
//! Checks that every node in a step tree carries the fields the engine
//! needs and copies inherited endpoints down the tree:
//! - Run name and step name are mandatory
//! - The run name must be a single directory name
//! - Without a peer list, a node needs its own step and log endpoints
//! - Without a peer list, a node with dependencies needs a dependency endpoint
//! - A node needs a capability or at least one sub-step
//!
//! Validation stops at the first violation and is never retried.

use std::fmt;
use std::path::{Component, Path};

use log::{debug, info};
use thiserror::Error;

use super::model::{is_blank, Step};

/// Log file name used when a step does not name one.
pub const DEFAULT_LOG_FILE: &str = "steprunner.log";

/// Identity of the step a validation error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIdentity {
    pub run_id: i32,
    pub run_name: String,
    pub step_id: i32,
    pub step_name: String,
}

impl StepIdentity {
    fn of(step: &Step) -> Self {
        Self {
            run_id: step.run_id,
            run_name: step.run_name.clone(),
            step_id: step.step_id,
            step_name: step.step_name.clone(),
        }
    }
}

impl fmt::Display for StepIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RunId: {} Run Name: {} StepId {} Step Name {}",
            self.run_id, self.run_name, self.step_id, self.step_name
        )
    }
}

/// Structural errors that make a step tree unrunnable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("RunId: {run_id} - Run Name is missing.")]
    MissingRunName { run_id: i32 },

    #[error("RunId: {run_id} Run Name: {run_name} - Run Name must be a single directory name.")]
    InvalidRunName { run_id: i32, run_name: String },

    #[error("RunId: {run_id} Run Name: {run_name} StepId {step_id} - Step Name is missing.")]
    MissingStepName {
        run_id: i32,
        run_name: String,
        step_id: i32,
    },

    #[error("{0} - Step url is missing.")]
    MissingStepUrl(StepIdentity),

    #[error("{0} - Log url is missing.")]
    MissingLogUrl(StepIdentity),

    #[error("{0} - Dependency url is missing.")]
    MissingDependencyUrl(StepIdentity),

    #[error("{0} - If TargetType or TargetAssembly is missing then at least one sub step is required.")]
    MissingTarget(StepIdentity),
}

impl ValidationError {
    /// Name of the field that failed validation.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingRunName { .. } | Self::InvalidRunName { .. } => "runName",
            Self::MissingStepName { .. } => "stepName",
            Self::MissingStepUrl(_) => "stepUrl",
            Self::MissingLogUrl(_) => "logUrl",
            Self::MissingDependencyUrl(_) => "dependencyUrl",
            Self::MissingTarget(_) => "targetType",
        }
    }
}

/// Validates a step tree and fills in inherited defaults.
///
/// Each node is checked in a fixed order (run name, step name, step
/// endpoint, log endpoint, dependency endpoint, capability-or-sub-step) and
/// the first violation is returned. After a node passes, its endpoints are
/// copied into any child that left them unset and the children are
/// validated depth-first: sub-steps first, then transition steps.
///
/// # Example
///
/// ```
/// use steprunner::workflow::{validate, Step};
///
/// let mut step = Step::new(1, "nightly", 1, "root")
///     .with_urls(vec!["http://peer:5000/run".to_string()])
///     .with_sub_step(Step::new(1, "nightly", 2, "child").with_capability("c.sh", "C"));
///
/// validate(&mut step).unwrap();
/// assert_eq!(step.sub_steps[0].urls, step.urls);
/// ```
pub fn validate(step: &mut Step) -> Result<(), ValidationError> {
    info!(
        "Validating step tree '{}' ({} steps)",
        step.run_name,
        step.tree_size()
    );
    validate_node(step)
}

fn validate_node(step: &mut Step) -> Result<(), ValidationError> {
    check_identity(step)?;

    let has_urls = step.has_urls();

    if !has_urls && is_blank(step.step_url.as_deref()) {
        return Err(ValidationError::MissingStepUrl(StepIdentity::of(step)));
    }

    let first_url = step.first_url().map(str::to_string);

    if is_blank(step.log_url.as_deref()) {
        match first_url.clone() {
            Some(url) => step.log_url = Some(url),
            None => return Err(ValidationError::MissingLogUrl(StepIdentity::of(step))),
        }
    }

    if !step.dependencies.is_empty() && is_blank(step.dependency_url.as_deref()) {
        match first_url {
            Some(url) => step.dependency_url = Some(url),
            None => {
                return Err(ValidationError::MissingDependencyUrl(StepIdentity::of(
                    step,
                )))
            }
        }
    }

    if step.capability().is_none() && step.sub_steps.is_empty() {
        return Err(ValidationError::MissingTarget(StepIdentity::of(step)));
    }

    if is_blank(step.log_file_location.as_deref()) {
        step.log_file_location = Some(DEFAULT_LOG_FILE.to_string());
    }

    let endpoints = Endpoints::of(step);
    for child in step
        .sub_steps
        .iter_mut()
        .chain(step.transition_steps.iter_mut())
    {
        endpoints.copy_into(child);
        validate_node(child)?;
    }

    debug!("Step '{}' validated", step.step_name);
    Ok(())
}

/// Checks the identity fields only. Used by the engine before it runs a
/// step that was validated elsewhere.
pub fn check_identity(step: &Step) -> Result<(), ValidationError> {
    if step.run_name.trim().is_empty() {
        return Err(ValidationError::MissingRunName {
            run_id: step.run_id,
        });
    }

    if !is_directory_name(step.run_name.trim()) {
        return Err(ValidationError::InvalidRunName {
            run_id: step.run_id,
            run_name: step.run_name.clone(),
        });
    }

    if step.step_name.trim().is_empty() {
        return Err(ValidationError::MissingStepName {
            run_id: step.run_id,
            run_name: step.run_name.clone(),
            step_id: step.step_id,
        });
    }

    Ok(())
}

/// True if `name` is exactly one normal path component.
fn is_directory_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Checks what the engine needs to start a step: identity, a log endpoint
/// and, when dependencies are declared, a dependency endpoint.
pub fn check_runnable(step: &Step) -> Result<(), ValidationError> {
    check_identity(step)?;

    if is_blank(step.log_url.as_deref()) {
        return Err(ValidationError::MissingLogUrl(StepIdentity::of(step)));
    }

    if !step.dependencies.is_empty() && is_blank(step.dependency_url.as_deref()) {
        return Err(ValidationError::MissingDependencyUrl(StepIdentity::of(step)));
    }

    Ok(())
}

/// Endpoint set a parent hands down to its children.
struct Endpoints {
    urls: Option<Vec<String>>,
    step_url: Option<String>,
    log_url: Option<String>,
    dependency_url: Option<String>,
}

impl Endpoints {
    fn of(step: &Step) -> Self {
        Self {
            urls: step.urls.clone(),
            step_url: step.step_url.clone(),
            log_url: step.log_url.clone(),
            dependency_url: step.dependency_url.clone(),
        }
    }

    fn copy_into(&self, child: &mut Step) {
        if child.urls.is_none() {
            child.urls = self.urls.clone();
        }
        if is_blank(child.step_url.as_deref()) {
            child.step_url = self.step_url.clone();
        }
        if is_blank(child.log_url.as_deref()) {
            child.log_url = self.log_url.clone();
        }
        if is_blank(child.dependency_url.as_deref()) {
            child.dependency_url = self.dependency_url.clone();
        }
    }
}
