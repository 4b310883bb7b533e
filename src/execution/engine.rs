//! Step Execution Engine
//!
//! Drives one step through its phases:
//! 1. Initialise: create the run directory and fetch dependencies
//! 2. Run: invoke the step's capability, if it has one
//! 3. RunSubSteps: distribute sub-steps in parallel and join
//! 4. Complete: mark the step complete, then distribute transition steps
//!
//! A phase that fails is logged and stops the step where it is; its status
//! is left at the last value it reached. Only structural errors found
//! before the first phase are returned to the caller.

use std::any::Any;
use std::mem;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::fs;

use super::capability::{CapabilityError, CapabilityLoader, CapabilityRegistry};
use super::context::{fan_out, RunContext};
use super::dependency::DependencyFetcher;
use super::distribution::{Distributor, HttpDistributor};
use crate::config::EngineConfig;
use crate::monitoring::StepLog;
use crate::notification::{StepNotification, StepNotifier};
use crate::workflow::model::is_blank;
use crate::workflow::validator::{check_runnable, validate};
use crate::workflow::{Step, StepStatus, ValidationError};

/// Errors returned by [`Engine::run`] and [`Engine::submit`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Step execution engine.
///
/// Holds only configuration and shared clients; everything belonging to a
/// single run lives in a [`RunContext`] built per call, so one engine (or
/// any clone of it) can serve overlapping runs.
///
/// # Example
///
/// ```rust,no_run
/// use steprunner::config::EngineConfig;
/// use steprunner::execution::Engine;
/// use steprunner::load_step;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let step = load_step("nightly.yaml")?;
///
///     let mut engine = Engine::new(&EngineConfig::default())?;
///     engine.set_work_root("/data/runs");
///
///     let result = engine.submit(step).await?;
///     println!("{}", result.status);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engine {
    http: reqwest::Client,
    work_root: PathBuf,
    max_fan_out: Option<usize>,
    fetcher: DependencyFetcher,
    loader: CapabilityLoader,
    distributor: Arc<dyn Distributor>,
    notifier: Option<StepNotifier>,
}

impl Engine {
    /// Creates an engine from configuration.
    ///
    /// Capabilities default to the built-in set and children are
    /// distributed over HTTP.
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self::with_client(builder.build()?, config))
    }

    /// Creates an engine that uses an existing HTTP client.
    pub fn with_client(http: reqwest::Client, config: &EngineConfig) -> Self {
        Self {
            fetcher: DependencyFetcher::new(http.clone(), config.max_fan_out),
            http,
            work_root: config.work_root.clone(),
            max_fan_out: config.max_fan_out,
            loader: CapabilityLoader::new(CapabilityRegistry::with_builtins()),
            distributor: Arc::new(HttpDistributor),
            notifier: None,
        }
    }

    /// Sets the directory run directories are created under.
    pub fn set_work_root(&mut self, dir: impl Into<PathBuf>) {
        self.work_root = dir.into();
    }

    /// Replaces the in-process capabilities.
    pub fn set_capabilities(&mut self, registry: CapabilityRegistry) {
        self.loader = CapabilityLoader::new(registry);
    }

    /// Sets how child steps are executed.
    pub fn set_distributor(&mut self, distributor: impl Distributor + 'static) {
        self.distributor = Arc::new(distributor);
    }

    /// Sets the notifier status changes are pushed to.
    pub fn set_notifier(&mut self, notifier: StepNotifier) {
        self.notifier = Some(notifier);
    }

    /// Caps concurrent branches within one fan-out batch.
    pub fn set_max_fan_out(&mut self, max: Option<usize>) {
        self.max_fan_out = max;
        self.fetcher = DependencyFetcher::new(self.http.clone(), max);
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn notifier(&self) -> Option<&StepNotifier> {
        self.notifier.as_ref()
    }

    /// Validates a step tree and runs it.
    pub async fn submit(&self, mut step: Step) -> Result<Step, EngineError> {
        validate(&mut step)?;
        self.run(step).await
    }

    /// Runs a step that has already been validated.
    ///
    /// Returns the step with its final status and the results of its
    /// children. Check [`Step::is_complete`] to learn whether it succeeded.
    pub async fn run(&self, mut step: Step) -> Result<Step, EngineError> {
        check_runnable(&step)?;

        let log = StepLog::new(
            self.http.clone(),
            step.log_url.as_deref().unwrap_or_default(),
        );
        let ctx = RunContext::new(&self.work_root, &step, log);

        info!(
            "Running step '{}' of run '{}' ({} steps)",
            step.step_name,
            step.run_name,
            step.tree_size()
        );

        self.process(&mut step, &ctx).await;

        info!("Step '{}' finished as {}", step.step_name, step.status);
        Ok(step)
    }

    async fn process(&self, step: &mut Step, ctx: &RunContext) {
        if !self.initialise(step, ctx).await {
            return;
        }

        if !self.run_capability(step, ctx).await {
            return;
        }

        if !self.run_sub_steps(step, ctx).await {
            return;
        }

        self.complete(step, ctx).await;
    }

    async fn initialise(&self, step: &mut Step, ctx: &RunContext) -> bool {
        self.set_status(step, StepStatus::Initialise, ctx).await;

        let run_dir = ctx.run_dir();
        if !fs::try_exists(run_dir).await.unwrap_or(false) {
            ctx.log()
                .write(step, &format!("Create directory {}", run_dir.display()))
                .await;

            if let Err(e) = fs::create_dir_all(run_dir).await {
                ctx.log()
                    .write(
                        step,
                        &format!("Failed to create directory {}: {}", run_dir.display(), e),
                    )
                    .await;
                return false;
            }
        }

        self.fetcher.fetch_all(step, ctx).await
    }

    async fn run_capability(&self, step: &mut Step, ctx: &RunContext) -> bool {
        self.set_status(step, StepStatus::InProgress, ctx).await;

        let reference = match step.capability() {
            Some(reference) => reference,
            None => {
                let message = if is_blank(step.target_assembly.as_deref()) {
                    "TargetAssembly is missing."
                } else {
                    "TargetType is missing."
                };
                ctx.log().write(step, message).await;
                return true;
            }
        };

        let capability = match self
            .loader
            .load(&reference, ctx.run_dir(), step.dependency_names())
            .await
        {
            Ok(capability) => capability,
            Err(e) => {
                ctx.log().write(step, &e.to_string()).await;
                return false;
            }
        };

        ctx.log()
            .write(step, &invocation_message("Before", &reference.type_name, step))
            .await;

        let outcome = AssertUnwindSafe(capability.run(step)).catch_unwind().await;

        let error = match outcome {
            Ok(Ok(())) => {
                ctx.log()
                    .write(step, &invocation_message("After", &reference.type_name, step))
                    .await;
                return true;
            }
            Ok(Err(e)) => e,
            Err(panic) => CapabilityError::Panicked(panic_message(panic.as_ref())),
        };

        warn!("Capability {} failed: {}", reference, error);
        ctx.log().write(step, &error.to_string()).await;
        false
    }

    async fn run_sub_steps(&self, step: &mut Step, ctx: &RunContext) -> bool {
        if step.sub_steps.is_empty() {
            ctx.log().write(step, "No sub steps").await;
            return true;
        }

        ctx.log().write(step, "Running sub steps").await;

        let mut children = mem::take(&mut step.sub_steps);
        let joined = self.join(step, &mut children, ctx).await;
        step.sub_steps = children;
        joined
    }

    async fn complete(&self, step: &mut Step, ctx: &RunContext) -> bool {
        self.set_status(step, StepStatus::Complete, ctx).await;

        if step.transition_steps.is_empty() {
            ctx.log().write(step, "No transition steps").await;
            return true;
        }

        ctx.log().write(step, "Running transition steps").await;

        let mut children = mem::take(&mut step.transition_steps);
        let joined = self.join(step, &mut children, ctx).await;
        step.transition_steps = children;
        joined
    }

    /// Distributes all children at once and waits for every one of them.
    ///
    /// Succeeds only if every child came back `Complete`. Each returned step
    /// replaces its slot; a child whose distribution failed keeps the value
    /// it was sent with.
    async fn join(&self, parent: &Step, children: &mut [Step], ctx: &RunContext) -> bool {
        let dispatches = children
            .iter()
            .map(|child| self.distributor.distribute(self, child))
            .collect::<Vec<_>>();
        let results = fan_out(dispatches, self.max_fan_out).await;

        let mut joined = true;
        for (slot, result) in children.iter_mut().zip(results) {
            match result {
                Ok(returned) => {
                    if !returned.is_complete() {
                        debug!(
                            "Step '{}' returned {} to '{}'",
                            returned.step_name, returned.status, parent.step_name
                        );
                        joined = false;
                    }
                    *slot = returned;
                }
                Err(e) => {
                    ctx.log().write(parent, &e.to_string()).await;
                    joined = false;
                }
            }
        }

        joined
    }

    async fn set_status(&self, step: &mut Step, status: StepStatus, ctx: &RunContext) {
        step.status = status;
        ctx.log().status(step).await;

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(vec![StepNotification::from_step(step, None)]) {
                debug!("Status of '{}' not published: {}", step.step_name, e);
            }
        }
    }
}

fn invocation_message(stage: &str, type_name: &str, step: &Step) -> String {
    format!(
        "{} {}.run() --> {}",
        stage,
        type_name,
        step.payload.as_deref().unwrap_or("")
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::capability::{Capability, BUILTIN_ASSEMBLY};
    use crate::execution::distribution::{DistributionError, LocalDistributor};
    use crate::notification::{
        start_step_notifier, BatchConfig, NotificationPublisher, PublishError,
    };
    use async_trait::async_trait;
    use httpmock::prelude::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    async fn log_server() -> MockServer {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/distributor/log");
                then.status(200);
            })
            .await;
        server
    }

    struct Fails;

    #[async_trait]
    impl Capability for Fails {
        async fn run(&self, _step: &mut Step) -> Result<(), CapabilityError> {
            Err(CapabilityError::Failed("capability exploded".to_string()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Capability for Panics {
        async fn run(&self, _step: &mut Step) -> Result<(), CapabilityError> {
            panic!("capability panicked")
        }
    }

    struct Suffix;

    #[async_trait]
    impl Capability for Suffix {
        async fn run(&self, step: &mut Step) -> Result<(), CapabilityError> {
            step.payload = Some(format!("{}-done", step.payload.as_deref().unwrap_or("")));
            Ok(())
        }
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::with_builtins();
        registry.register("test", "Fails", || Fails);
        registry.register("test", "Panics", || Panics);
        registry.register("test", "Suffix", || Suffix);
        registry
    }

    fn engine(work_root: &Path) -> Engine {
        let mut engine = Engine::new(&EngineConfig::default()).unwrap();
        engine.set_work_root(work_root);
        engine.set_capabilities(registry());
        engine.set_distributor(LocalDistributor);
        engine
    }

    fn leaf(step_id: i32, name: &str) -> Step {
        Step::new(1, "nightly", step_id, name).with_capability(BUILTIN_ASSEMBLY, "Echo")
    }

    /// Returns every child as complete except the one named `incomplete`.
    #[derive(Clone, Default)]
    struct Scripted {
        incomplete: Option<&'static str>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Distributor for Scripted {
        async fn distribute(
            &self,
            _engine: &Engine,
            step: &Step,
        ) -> Result<Step, DistributionError> {
            self.calls.lock().unwrap().push(step.step_name.clone());

            let mut result = step.clone();
            result.payload = Some(format!("result of {}", step.step_name));
            result.status = if self.incomplete == Some(step.step_name.as_str()) {
                StepStatus::InProgress
            } else {
                StepStatus::Complete
            };
            Ok(result)
        }
    }

    #[tokio::test]
    async fn test_sub_steps_complete() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let root = Step::new(1, "nightly", 1, "root")
            .with_urls(vec![server.base_url()])
            .with_sub_step(leaf(2, "left"))
            .with_sub_step(leaf(3, "right"));

        let result = engine(work.path()).submit(root).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        assert_eq!(result.sub_steps.len(), 2);
        assert!(result.sub_steps.iter().all(Step::is_complete));
        assert!(work.path().join("nightly").is_dir());
    }

    #[tokio::test]
    async fn test_existing_dependency_not_downloaded() {
        let server = MockServer::start_async().await;
        let store = server
            .mock_async(|when, then| {
                when.method(GET).path("/deps");
                then.status(200).body("fresh");
            })
            .await;
        let exists_logged = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/distributor/log")
                    .body_includes("File already exists");
                then.status(200);
            })
            .await;

        let work = tempdir().unwrap();
        std::fs::create_dir_all(work.path().join("nightly")).unwrap();
        std::fs::write(work.path().join("nightly").join("tool.sh"), "cached").unwrap();

        let step = leaf(1, "fetch")
            .with_urls(vec![server.base_url()])
            .with_dependency("bin/tool.sh")
            .with_dependency_url(server.url("/deps"));

        let result = engine(work.path()).submit(step).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        store.assert_calls_async(0).await;
        exists_logged.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_incomplete_sub_step_blocks_transitions() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let root = Step::new(1, "nightly", 1, "root")
            .with_urls(vec![server.base_url()])
            .with_sub_step(leaf(2, "good"))
            .with_sub_step(leaf(3, "bad"))
            .with_transition_step(leaf(4, "next"));

        let scripted = Scripted {
            incomplete: Some("bad"),
            ..Scripted::default()
        };
        let mut engine = engine(work.path());
        engine.set_distributor(scripted.clone());

        let result = engine.submit(root).await.unwrap();

        assert_eq!(result.status, StepStatus::InProgress);
        let mut calls = scripted.calls();
        calls.sort();
        assert_eq!(calls, vec!["bad", "good"]);
        assert_eq!(result.transition_steps[0].status, StepStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_returned_children_replace_slots() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let root = Step::new(1, "nightly", 1, "root")
            .with_urls(vec![server.base_url()])
            .with_sub_step(leaf(2, "sub"))
            .with_transition_step(leaf(3, "next"));

        let scripted = Scripted::default();
        let mut engine = engine(work.path());
        engine.set_distributor(scripted.clone());

        let result = engine.submit(root).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        assert_eq!(scripted.calls(), vec!["sub", "next"]);
        assert_eq!(result.sub_steps[0].payload.as_deref(), Some("result of sub"));
        assert_eq!(
            result.transition_steps[0].payload.as_deref(),
            Some("result of next")
        );
    }

    #[tokio::test]
    async fn test_failed_distribution_keeps_child() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        // No peer list and no step url on the child: nowhere to send it.
        let root = Step::new(1, "nightly", 1, "root")
            .with_log_url(server.base_url())
            .with_sub_step(leaf(2, "orphan"));

        let mut engine = engine(work.path());
        engine.set_distributor(HttpDistributor);

        let result = engine.run(root).await.unwrap();

        assert_eq!(result.status, StepStatus::InProgress);
        assert_eq!(result.sub_steps[0].status, StepStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_capability_failure_stops_step() {
        let server = MockServer::start_async().await;
        let failure_logged = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/distributor/log")
                    .body_includes("capability exploded");
                then.status(200);
            })
            .await;
        let work = tempdir().unwrap();

        let step = Step::new(1, "nightly", 1, "broken")
            .with_urls(vec![server.base_url()])
            .with_capability("test", "Fails")
            .with_sub_step(leaf(2, "never"));

        let result = engine(work.path()).submit(step).await.unwrap();

        assert_eq!(result.status, StepStatus::InProgress);
        assert_eq!(result.sub_steps[0].status, StepStatus::NotStarted);
        failure_logged.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_capability_panic_is_contained() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let step = Step::new(1, "nightly", 1, "panics")
            .with_urls(vec![server.base_url()])
            .with_capability("test", "Panics");

        let result = engine(work.path()).submit(step).await.unwrap();
        assert_eq!(result.status, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unknown_capability_stops_step() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let step = Step::new(1, "nightly", 1, "missing")
            .with_urls(vec![server.base_url()])
            .with_capability("absent.sh", "Nothing");

        let result = engine(work.path()).submit(step).await.unwrap();
        assert_eq!(result.status, StepStatus::InProgress);
    }

    #[tokio::test]
    async fn test_capability_payload_kept() {
        let server = MockServer::start_async().await;
        let after_logged = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/distributor/log")
                    .body_includes("After Suffix.run() --> in-done");
                then.status(200);
            })
            .await;
        let work = tempdir().unwrap();

        let step = Step::new(1, "nightly", 1, "suffix")
            .with_urls(vec![server.base_url()])
            .with_capability("test", "Suffix")
            .with_payload("in");

        let result = engine(work.path()).submit(step).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        assert_eq!(result.payload.as_deref(), Some("in-done"));
        after_logged.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_missing_target_type_is_noop() {
        let server = MockServer::start_async().await;
        let noop_logged = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/distributor/log")
                    .body_includes("TargetType is missing.");
                then.status(200);
            })
            .await;
        let work = tempdir().unwrap();

        let mut step = Step::new(1, "nightly", 1, "grouping")
            .with_urls(vec![server.base_url()])
            .with_sub_step(leaf(2, "child"));
        step.target_assembly = Some("only-assembly.sh".to_string());

        let result = engine(work.path()).submit(step).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        noop_logged.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_run_rejects_missing_log_url() {
        let work = tempdir().unwrap();
        let step = leaf(1, "no-log");

        let result = engine(work.path()).run(step).await;
        assert!(matches!(
            result,
            Err(EngineError::Invalid(ValidationError::MissingLogUrl(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_rejects_dependencies_without_store() {
        let work = tempdir().unwrap();
        let step = leaf(1, "deps")
            .with_log_url("http://127.0.0.1:9")
            .with_dependency("lib.so");

        let result = engine(work.path()).run(step).await;
        assert!(matches!(
            result,
            Err(EngineError::Invalid(ValidationError::MissingDependencyUrl(_)))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_tree() {
        let work = tempdir().unwrap();
        let step = Step::new(1, "", 1, "root");

        let result = engine(work.path()).submit(step).await;
        assert!(matches!(
            result,
            Err(EngineError::Invalid(ValidationError::MissingRunName { .. }))
        ));
    }

    #[derive(Clone, Default)]
    struct Recorder {
        statuses: Arc<Mutex<Vec<(String, StepStatus)>>>,
    }

    #[async_trait]
    impl NotificationPublisher for Recorder {
        async fn publish(
            &self,
            notifications: Vec<StepNotification>,
        ) -> Result<(), PublishError> {
            let mut statuses = self.statuses.lock().unwrap();
            for n in notifications {
                statuses.push((n.step_name, n.status));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_status_changes_are_notified() {
        let server = log_server().await;
        let work = tempdir().unwrap();

        let recorder = Recorder::default();
        let mut engine = engine(work.path());
        engine.set_notifier(start_step_notifier(recorder.clone(), BatchConfig::default()));

        let step = leaf(1, "single").with_urls(vec![server.base_url()]);
        engine.submit(step).await.unwrap();

        if let Some(notifier) = engine.notifier() {
            notifier.shutdown().await;
        }

        let statuses: Vec<StepStatus> = recorder
            .statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, status)| *status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Initialise,
                StepStatus::InProgress,
                StepStatus::Complete
            ]
        );
    }

    #[tokio::test]
    async fn test_run_on_spawned_task() {
        let server = log_server().await;
        let work = tempdir().unwrap();
        let engine = engine(work.path());

        let root = Step::new(1, "nightly", 1, "root")
            .with_urls(vec![server.base_url()])
            .with_sub_step(leaf(2, "left"))
            .with_transition_step(leaf(3, "next"));

        let result = tokio::spawn(async move { engine.submit(root).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        assert!(result.transition_steps[0].is_complete());
    }

    #[test]
    fn test_panic_message() {
        let text: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(text.as_ref()), "boom");

        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(owned.as_ref()), "owned boom");

        let other: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn test_echo_is_default_capability() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        assert!(engine
            .loader
            .registry()
            .contains(&crate::workflow::CapabilityRef {
                assembly: BUILTIN_ASSEMBLY.to_string(),
                type_name: "Echo".to_string(),
            }));
    }
}
