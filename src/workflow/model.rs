//! Step Tree Data Model
//!
//! A workflow is a tree of [`Step`]s. Each step may run a capability,
//! fan out to parallel sub-steps, and continue to transition steps once
//! it is complete.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "runId": 7,
//!   "runName": "nightly",
//!   "stepId": 1,
//!   "stepName": "prepare",
//!   "urls": ["http://peer-a:5000/run", "http://peer-b:5000/run"],
//!   "dependencyUrl": "http://store:5000/api/dependencies",
//!   "subSteps": [
//!     {
//!       "runId": 7,
//!       "runName": "nightly",
//!       "stepId": 2,
//!       "stepName": "extract",
//!       "targetAssembly": "extract.sh",
//!       "targetType": "Extract",
//!       "dependencies": ["tools/extract.sh"]
//!     }
//!   ]
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Progress of a step through the engine's phases.
///
/// There is no failed variant. A step that fails stays at the
/// last status it reached, so "not `Complete` after the call returned" is
/// the failure signal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepStatus {
    /// Step has not been picked up yet
    #[default]
    NotStarted,
    /// Working directory and dependencies are being prepared
    Initialise,
    /// Capability and sub-steps are executing
    InProgress,
    /// Step and all its sub-steps finished successfully
    Complete,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::Initialise => "Initialise",
            Self::InProgress => "InProgress",
            Self::Complete => "Complete",
        };
        f.write_str(name)
    }
}

/// A node in the workflow tree.
///
/// Steps own their `sub_steps` and `transition_steps` exclusively. Endpoint
/// fields left unset are filled in from the nearest ancestor during
/// validation.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Step {
    /// Identifier of the workflow run
    pub run_id: i32,

    /// Name of the workflow run, also the name of the run's working directory
    pub run_name: String,

    /// Identifier of this step within the run
    pub step_id: i32,

    /// Name of this step within the run
    pub step_name: String,

    /// Opaque data handed to the capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    /// Type name of the capability to execute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,

    /// Loadable unit containing `target_type`, relative to the run directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_assembly: Option<String>,

    /// Where the target assembly was downloaded from (informational)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_download_location: Option<String>,

    /// Advisory log file name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file_location: Option<String>,

    /// Current phase of the step
    pub status: StepStatus,

    /// Remote files the capability needs, fetched before it runs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Child steps run in parallel after this step's capability
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<Step>,

    /// Child steps run in parallel once this step is complete
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transition_steps: Vec<Step>,

    /// Endpoint this step is executed by when no peer list is set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_url: Option<String>,

    /// Dependency store endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_url: Option<String>,

    /// Log sink endpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,

    /// Candidate peer endpoints for distributing children.
    /// `None` means unset and inheritable; `Some(vec![])` is an explicit empty list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
}

/// Returns true when an optional text field is missing or whitespace-only.
pub fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// A (loadable unit, type name) pair naming a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityRef {
    pub assembly: String,
    pub type_name: String,
}

impl fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.assembly, self.type_name)
    }
}

impl Step {
    /// Creates a new step with the given identity.
    ///
    /// # Example
    ///
    /// ```
    /// use steprunner::workflow::Step;
    ///
    /// let step = Step::new(1, "nightly", 1, "prepare")
    ///     .with_capability("prepare.sh", "Prepare")
    ///     .with_urls(vec!["http://peer:5000/run".to_string()]);
    /// assert!(step.capability().is_some());
    /// ```
    pub fn new(
        run_id: i32,
        run_name: impl Into<String>,
        step_id: i32,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            run_name: run_name.into().trim().to_string(),
            step_id,
            step_name: step_name.into().trim().to_string(),
            ..Self::default()
        }
    }

    /// Sets the capability to run for this step.
    pub fn with_capability(
        mut self,
        assembly: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        self.target_assembly = Some(assembly.into());
        self.target_type = Some(type_name.into());
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Adds a dependency file identifier.
    pub fn with_dependency(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Adds a sub-step.
    pub fn with_sub_step(mut self, step: Step) -> Self {
        self.sub_steps.push(step);
        self
    }

    /// Adds a transition step.
    pub fn with_transition_step(mut self, step: Step) -> Self {
        self.transition_steps.push(step);
        self
    }

    /// Sets the candidate peer endpoints.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = Some(urls);
        self
    }

    /// Sets the step endpoint.
    pub fn with_step_url(mut self, url: impl Into<String>) -> Self {
        self.step_url = Some(url.into());
        self
    }

    /// Sets the log sink endpoint.
    pub fn with_log_url(mut self, url: impl Into<String>) -> Self {
        self.log_url = Some(url.into());
        self
    }

    /// Sets the dependency store endpoint.
    pub fn with_dependency_url(mut self, url: impl Into<String>) -> Self {
        self.dependency_url = Some(url.into());
        self
    }

    /// Returns the capability reference when both parts are set.
    pub fn capability(&self) -> Option<CapabilityRef> {
        match (self.target_assembly.as_deref(), self.target_type.as_deref()) {
            (Some(assembly), Some(type_name))
                if !assembly.trim().is_empty() && !type_name.trim().is_empty() =>
            {
                Some(CapabilityRef {
                    assembly: assembly.trim().to_string(),
                    type_name: type_name.trim().to_string(),
                })
            }
            _ => None,
        }
    }

    /// Returns true when the peer list is set and non-empty.
    pub fn has_urls(&self) -> bool {
        self.urls.as_ref().is_some_and(|urls| !urls.is_empty())
    }

    /// Returns the first peer endpoint, if any.
    pub fn first_url(&self) -> Option<&str> {
        self.urls
            .as_ref()
            .and_then(|urls| urls.first())
            .map(String::as_str)
    }

    /// Returns true once the step has reached `Complete`.
    pub fn is_complete(&self) -> bool {
        self.status == StepStatus::Complete
    }

    /// Local file names of the declared dependencies, in declaration order.
    pub fn dependency_file_names(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|d| local_file_name(d).to_string())
            .collect()
    }

    /// Dependency names with their extensions stripped.
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|d| {
                let file_name = local_file_name(d);
                match file_name.rfind('.') {
                    Some(0) | None => file_name.to_string(),
                    Some(index) => file_name[..index].to_string(),
                }
            })
            .collect()
    }

    /// Counts this step and all of its descendants.
    pub fn tree_size(&self) -> usize {
        1 + self
            .sub_steps
            .iter()
            .chain(self.transition_steps.iter())
            .map(Step::tree_size)
            .sum::<usize>()
    }
}

/// Strips any `/` or `\` separated prefix from a dependency identifier.
pub fn local_file_name(dependency: &str) -> &str {
    dependency
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(dependency)
}
