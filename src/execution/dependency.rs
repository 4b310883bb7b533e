//! Dependency Fetching
//!
//! Downloads the files a step's capability needs from the dependency store
//! into the run directory. Files already present are not fetched again,
//! which makes re-entering a partially populated run directory safe.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use log::debug;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::context::{fan_out, RunContext};
use crate::workflow::model::{is_blank, local_file_name, Step};

/// Errors raised while fetching a single dependency.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Dependency url is missing.")]
    MissingEndpoint,

    #[error("Dependency '{0}' does not name a file.")]
    InvalidName(String),

    #[error("Failed to retrieve '{dependency}': {source}")]
    Request {
        dependency: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to write '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What happened to one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The file was already in the run directory
    AlreadyPresent(PathBuf),
    /// The file was downloaded
    Downloaded(PathBuf),
}

/// Fetches step dependencies from a dependency store.
#[derive(Clone)]
pub struct DependencyFetcher {
    http: reqwest::Client,
    max_fan_out: Option<usize>,
}

impl DependencyFetcher {
    /// Creates a fetcher. `max_fan_out` caps concurrent downloads per step.
    pub fn new(http: reqwest::Client, max_fan_out: Option<usize>) -> Self {
        Self { http, max_fan_out }
    }

    /// Fetches every dependency of `step` concurrently.
    ///
    /// Returns true only if all of them are present afterwards. Failures are
    /// logged against the step; files fetched before a failure stay on disk.
    pub async fn fetch_all(&self, step: &Step, ctx: &RunContext) -> bool {
        if step.dependencies.is_empty() {
            ctx.log().write(step, "No dependencies").await;
            return true;
        }

        let endpoint = match step.dependency_url.as_deref() {
            Some(url) if !is_blank(Some(url)) => url,
            _ => {
                ctx.log()
                    .write(step, &FetchError::MissingEndpoint.to_string())
                    .await;
                return false;
            }
        };

        ctx.log().write(step, "Downloading dependencies...").await;

        let fetches = step
            .dependencies
            .iter()
            .map(|dependency| self.fetch_logged(step, ctx, endpoint, dependency))
            .collect::<Vec<_>>();

        fan_out(fetches, self.max_fan_out)
            .await
            .into_iter()
            .all(|fetched| fetched)
    }

    async fn fetch_logged(
        &self,
        step: &Step,
        ctx: &RunContext,
        endpoint: &str,
        dependency: &str,
    ) -> bool {
        match self.fetch(endpoint, dependency, ctx.run_dir()).await {
            Ok(FetchOutcome::AlreadyPresent(path)) => {
                ctx.log()
                    .write(step, &format!("File already exists: {}", path.display()))
                    .await;
                true
            }
            Ok(FetchOutcome::Downloaded(path)) => {
                ctx.log()
                    .write(step, &format!("Downloaded: {}", path.display()))
                    .await;
                true
            }
            Err(e) => {
                ctx.log().write(step, &e.to_string()).await;
                false
            }
        }
    }

    /// Fetches one dependency into `dir`.
    ///
    /// The file is requested as `GET {endpoint}?file={dependency}` and named
    /// after the last path segment of `dependency`. Bytes are streamed to a
    /// `.part` file that is renamed once complete.
    pub async fn fetch(
        &self,
        endpoint: &str,
        dependency: &str,
        dir: &Path,
    ) -> Result<FetchOutcome, FetchError> {
        let file_name = local_file_name(dependency);
        if matches!(file_name.trim(), "" | "." | "..") {
            return Err(FetchError::InvalidName(dependency.to_string()));
        }
        let path = dir.join(file_name);

        let present = fs::metadata(&path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false);
        if present {
            debug!("Dependency {} already present", path.display());
            return Ok(FetchOutcome::AlreadyPresent(path));
        }

        let request_error = |source| FetchError::Request {
            dependency: dependency.to_string(),
            source,
        };

        let response = self
            .http
            .get(endpoint)
            .query(&[("file", dependency)])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(request_error)?;

        let partial = dir.join(format!("{}.part", file_name));
        let write_error = |source| FetchError::Write {
            path: partial.clone(),
            source,
        };

        let mut file = File::create(&partial).await.map_err(write_error)?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(request_error)?;
            file.write_all(&chunk).await.map_err(write_error)?;
        }
        file.flush().await.map_err(write_error)?;
        drop(file);

        fs::rename(&partial, &path).await.map_err(write_error)?;
        debug!("Dependency {} written", path.display());

        Ok(FetchOutcome::Downloaded(path))
    }
}
