//! Step Distribution
//!
//! Hands a child step to an engine instance and returns the result that
//! instance computed. The sender keeps no handle to the child's live state;
//! the returned step is authoritative.

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use super::engine::{Engine, EngineError};
use crate::workflow::model::is_blank;
use crate::workflow::Step;

#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("Step '{0}' has no peer url or step url to distribute to")]
    NoEndpoint(String),

    #[error("Distribution to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Step '{step}' was rejected: {source}")]
    Rejected {
        step: String,
        #[source]
        source: EngineError,
    },
}

/// Runs a child step somewhere and returns its outcome.
#[async_trait]
pub trait Distributor: Send + Sync {
    async fn distribute(&self, engine: &Engine, step: &Step) -> Result<Step, DistributionError>;
}

/// Posts the child to the first of its peer urls.
///
/// Only the first peer is ever tried. When the peer list is empty the
/// child's step url is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDistributor;

impl HttpDistributor {
    /// Returns the endpoint `step` would be posted to.
    pub fn target(step: &Step) -> Option<&str> {
        let usable = |url: &&str| !is_blank(Some(*url));

        step.first_url()
            .filter(usable)
            .or_else(|| step.step_url.as_deref().filter(usable))
    }
}

#[async_trait]
impl Distributor for HttpDistributor {
    async fn distribute(&self, engine: &Engine, step: &Step) -> Result<Step, DistributionError> {
        let endpoint = Self::target(step)
            .ok_or_else(|| DistributionError::NoEndpoint(step.step_name.clone()))?;

        debug!("Distributing step '{}' to {}", step.step_name, endpoint);

        let request_error = |source| DistributionError::Request {
            endpoint: endpoint.to_string(),
            source,
        };

        engine
            .http()
            .post(endpoint)
            .json(step)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(request_error)?
            .json::<Step>()
            .await
            .map_err(request_error)
    }
}

/// Runs the child on the same engine, in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDistributor;

#[async_trait]
impl Distributor for LocalDistributor {
    async fn distribute(&self, engine: &Engine, step: &Step) -> Result<Step, DistributionError> {
        debug!("Running step '{}' locally", step.step_name);

        engine
            .run(step.clone())
            .await
            .map_err(|source| DistributionError::Rejected {
                step: step.step_name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::workflow::StepStatus;
    use httpmock::prelude::*;

    fn engine() -> Engine {
        Engine::new(&EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_target_prefers_first_url() {
        let step = Step::new(1, "run", 2, "child")
            .with_urls(vec!["http://a/run".to_string(), "http://b/run".to_string()])
            .with_step_url("http://c/run");
        assert_eq!(HttpDistributor::target(&step), Some("http://a/run"));

        let step = Step::new(1, "run", 2, "child")
            .with_urls(Vec::new())
            .with_step_url("http://c/run");
        assert_eq!(HttpDistributor::target(&step), Some("http://c/run"));

        let step = Step::new(1, "run", 2, "child").with_step_url("  ");
        assert_eq!(HttpDistributor::target(&step), None);
    }

    #[tokio::test]
    async fn test_http_distributor_returns_peer_result() {
        let server = MockServer::start_async().await;
        let mut done = Step::new(1, "run", 2, "child");
        done.status = StepStatus::Complete;
        done.payload = Some("from peer".to_string());

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/run")
                    .header("content-type", "application/json")
                    .body_includes("\"stepName\":\"child\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(serde_json::to_string(&done).unwrap());
            })
            .await;

        let child = Step::new(1, "run", 2, "child").with_urls(vec![server.url("/run")]);
        let result = HttpDistributor.distribute(&engine(), &child).await.unwrap();

        assert_eq!(result.status, StepStatus::Complete);
        assert_eq!(result.payload.as_deref(), Some("from peer"));
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn test_http_distributor_only_tries_first_peer() {
        let first = MockServer::start_async().await;
        let second = MockServer::start_async().await;
        first
            .mock_async(|when, then| {
                when.method(POST);
                then.status(500);
            })
            .await;
        let fallback = second
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200);
            })
            .await;

        let child = Step::new(1, "run", 2, "child")
            .with_urls(vec![first.url("/run"), second.url("/run")]);
        let result = HttpDistributor.distribute(&engine(), &child).await;

        assert!(matches!(result, Err(DistributionError::Request { .. })));
        fallback.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn test_http_distributor_without_endpoint() {
        let child = Step::new(1, "run", 2, "child");
        assert!(matches!(
            HttpDistributor.distribute(&engine(), &child).await,
            Err(DistributionError::NoEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_local_distributor_rejects_invalid_step() {
        let child = Step::new(1, "", 2, "child");
        let result = LocalDistributor.distribute(&engine(), &child).await;

        assert!(matches!(result, Err(DistributionError::Rejected { .. })));
    }
}
