//! Step Status Notifications
//!
//! The step-specific layer on top of [`BatchNotifier`](super::BatchNotifier):
//! the notification record, the publisher contract and the bundled
//! publishers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::batch::Notify;
use crate::workflow::{Step, StepStatus};

/// One status change of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNotification {
    pub run_id: i32,
    pub run_name: String,
    pub step_id: i32,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepNotification {
    /// Captures the current status of `step`.
    pub fn from_step(step: &Step, message: Option<String>) -> Self {
        Self {
            run_id: step.run_id,
            run_name: step.run_name.clone(),
            step_id: step.step_id,
            step_name: step.step_name.clone(),
            status: step.status,
            message,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Notification endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Delivers notifications downstream.
#[async_trait]
pub trait NotificationPublisher: Send + Sync + 'static {
    async fn publish(&self, notifications: Vec<StepNotification>) -> Result<(), PublishError>;
}

/// Adapts a [`NotificationPublisher`] to the batch notifier.
///
/// Each producer batch is published separately and in queue order. A failed
/// publish is logged and the next batch is still attempted.
pub struct StepPublisher<P> {
    publisher: P,
}

impl<P: NotificationPublisher> StepPublisher<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl<P: NotificationPublisher> Notify<Vec<StepNotification>> for StepPublisher<P> {
    async fn notify(&self, items: Vec<Vec<StepNotification>>) {
        for batch in items {
            let count = batch.len();
            if let Err(e) = self.publisher.publish(batch).await {
                warn!("Failed to publish {} notifications: {}", count, e);
            }
        }
    }
}

/// Writes notifications to the process log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl NotificationPublisher for LogPublisher {
    async fn publish(&self, notifications: Vec<StepNotification>) -> Result<(), PublishError> {
        for n in notifications {
            info!(
                "[notify] RunId: {}; StepId: {}; Step Name: {}; Step Status: {}{}",
                n.run_id,
                n.step_id,
                n.step_name,
                n.status,
                n.message
                    .as_deref()
                    .map(|m| format!("; Message: {}", m))
                    .unwrap_or_default()
            );
        }
        Ok(())
    }
}

/// Posts notifications as a JSON array to an endpoint.
#[derive(Clone)]
pub struct HttpPublisher {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpPublisher {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NotificationPublisher for HttpPublisher {
    async fn publish(&self, notifications: Vec<StepNotification>) -> Result<(), PublishError> {
        self.http
            .post(&self.endpoint)
            .json(&notifications)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
