//! Capability Loading and Invocation
//!
//! A capability is the unit of business logic a step executes. It is named
//! by a (loadable unit, type name) pair and resolved in two ways:
//! - Registered in-process through a [`CapabilityRegistry`] factory
//! - Shipped as an executable among the step's fetched dependencies and run
//!   as an isolated child process
//!
//! A fresh instance is created for every invocation.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, warn};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::workflow::{CapabilityRef, Step};

/// Environment variable listing the dependency names a process capability may use.
pub const DEPENDENCIES_VAR: &str = "STEP_DEPENDENCIES";

/// Environment variable carrying the requested type name.
pub const TARGET_TYPE_VAR: &str = "STEP_TARGET_TYPE";

/// Environment variable carrying the run directory.
pub const RUN_DIR_VAR: &str = "STEP_RUN_DIR";

/// Errors raised while loading or running a capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Capability '{0}' was not found in the registry or the run directory")]
    NotFound(CapabilityRef),

    #[error("Capability '{reference}' could not be started: {source}")]
    Spawn {
        reference: CapabilityRef,
        #[source]
        source: std::io::Error,
    },

    #[error("Capability '{reference}' exited with code {code:?}: {stderr}")]
    Exited {
        reference: CapabilityRef,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Capability '{reference}' returned an invalid step: {source}")]
    InvalidOutput {
        reference: CapabilityRef,
        #[source]
        source: serde_json::Error,
    },

    #[error("Capability panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

/// The single entry operation every capability implements.
///
/// The capability receives the step it runs for and may rewrite its
/// payload.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn run(&self, step: &mut Step) -> Result<(), CapabilityError>;
}

/// Creates a new capability instance.
pub type CapabilityFactory = Arc<dyn Fn() -> Box<dyn Capability> + Send + Sync>;

/// In-process capabilities keyed by their reference.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    factories: HashMap<CapabilityRef, CapabilityFactory>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in capabilities (`builtin::Echo`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(BUILTIN_ASSEMBLY, "Echo", || Echo);
        registry
    }

    /// Registers a factory for `assembly::type_name`, replacing any previous one.
    pub fn register<F, C>(
        &mut self,
        assembly: impl Into<String>,
        type_name: impl Into<String>,
        factory: F,
    ) where
        F: Fn() -> C + Send + Sync + 'static,
        C: Capability + 'static,
    {
        let reference = CapabilityRef {
            assembly: assembly.into(),
            type_name: type_name.into(),
        };
        debug!("Registered capability {}", reference);
        self.factories.insert(
            reference,
            Arc::new(move || Box::new(factory()) as Box<dyn Capability>),
        );
    }

    /// Returns true if `reference` has a registered factory.
    pub fn contains(&self, reference: &CapabilityRef) -> bool {
        self.factories.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    fn instantiate(&self, reference: &CapabilityRef) -> Option<Box<dyn Capability>> {
        self.factories.get(reference).map(|factory| factory())
    }
}

/// Resolves capability references to runnable instances.
#[derive(Clone, Default)]
pub struct CapabilityLoader {
    registry: Arc<CapabilityRegistry>,
}

impl CapabilityLoader {
    pub fn new(registry: CapabilityRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Loads the capability named by `reference`.
    ///
    /// Registry entries win. Otherwise `reference.assembly` must name an
    /// executable inside `run_dir`; it will only see `dependencies` (names
    /// without extensions) and the run directory.
    pub async fn load(
        &self,
        reference: &CapabilityRef,
        run_dir: &Path,
        dependencies: Vec<String>,
    ) -> Result<Box<dyn Capability>, CapabilityError> {
        if let Some(capability) = self.registry.instantiate(reference) {
            debug!("Capability {} resolved from registry", reference);
            return Ok(capability);
        }

        let relative = Path::new(&reference.assembly);
        let contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));

        let program = run_dir.join(relative);
        let is_file = contained
            && tokio::fs::metadata(&program)
                .await
                .map(|metadata| metadata.is_file())
                .unwrap_or(false);

        if is_file {
            debug!("Capability {} resolved to {}", reference, program.display());
            return Ok(Box::new(ProcessCapability {
                reference: reference.clone(),
                program,
                run_dir: run_dir.to_path_buf(),
                dependencies,
            }));
        }

        Err(CapabilityError::NotFound(reference.clone()))
    }
}

/// A capability executed as a child process.
///
/// The process gets a cleared environment, the run directory as working
/// directory and first `PATH` entry, the step as JSON on stdin, and must
/// print the resulting step as JSON on stdout. Only the returned payload is
/// taken over.
pub struct ProcessCapability {
    reference: CapabilityRef,
    program: PathBuf,
    run_dir: PathBuf,
    dependencies: Vec<String>,
}

impl ProcessCapability {
    fn search_path(&self) -> std::ffi::OsString {
        let mut entries = vec![self.run_dir.clone()];
        if let Some(host_path) = std::env::var_os("PATH") {
            entries.extend(std::env::split_paths(&host_path));
        }
        std::env::join_paths(entries).unwrap_or_else(|e| {
            warn!("Could not build PATH for {}: {}", self.reference, e);
            self.run_dir.clone().into_os_string()
        })
    }
}

#[async_trait]
impl Capability for ProcessCapability {
    async fn run(&self, step: &mut Step) -> Result<(), CapabilityError> {
        let input = serde_json::to_vec(&*step).map_err(|source| CapabilityError::InvalidOutput {
            reference: self.reference.clone(),
            source,
        })?;

        let mut child = Command::new(&self.program)
            .arg(&self.reference.type_name)
            .current_dir(&self.run_dir)
            .env_clear()
            .env("PATH", self.search_path())
            .env(DEPENDENCIES_VAR, self.dependencies.join(","))
            .env(TARGET_TYPE_VAR, &self.reference.type_name)
            .env(RUN_DIR_VAR, &self.run_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CapabilityError::Spawn {
                reference: self.reference.clone(),
                source,
            })?;

        // Feed stdin concurrently so a chatty child cannot block on a full stdout pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Capability closed stdin early: {}", e);
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| CapabilityError::Spawn {
                reference: self.reference.clone(),
                source,
            })?;

        if let Some(writer) = writer {
            let _ = writer.await;
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                "Capability {} failed with exit code: {:?}",
                self.reference,
                output.status.code()
            );
            return Err(CapabilityError::Exited {
                reference: self.reference.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        let returned: Step =
            serde_json::from_slice(&output.stdout).map_err(|source| {
                CapabilityError::InvalidOutput {
                    reference: self.reference.clone(),
                    source,
                }
            })?;

        step.payload = returned.payload;
        Ok(())
    }
}

/// Assembly name under which built-in capabilities are registered.
pub const BUILTIN_ASSEMBLY: &str = "builtin";

/// Leaves the payload untouched.
pub struct Echo;

#[async_trait]
impl Capability for Echo {
    async fn run(&self, step: &mut Step) -> Result<(), CapabilityError> {
        debug!(
            "Echo for step '{}': {}",
            step.step_name,
            step.payload.as_deref().unwrap_or("")
        );
        Ok(())
    }
}
