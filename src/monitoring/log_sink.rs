//! Remote Step Log
//!
//! Every phase of a step is reported to the run's log sink as a single
//! line posted to `api/distributor/log`, resolved against the step's log
//! url. Lines are mirrored to the local logger. A failing log call never
//! fails the step.

use chrono::Local;
use log::{info, warn};
use once_cell::sync::Lazy;
use reqwest::Url;
use sysinfo::System;

use crate::workflow::Step;

/// Path appended to a step's log endpoint.
pub const LOG_ROUTE: &str = "api/distributor/log";

/// Name of this machine as reported in log lines.
pub static HOST_NAME: Lazy<String> =
    Lazy::new(|| System::host_name().unwrap_or_else(|| "unknown-host".to_string()));

/// Formats a log line for a step.
///
/// `{timestamp}   {host}   RunId: ..; Run Name: ..; StepId: ..; Step Name: ..; Step Status: ..[; Message: ..]`
pub fn format_message(step: &Step, message: &str) -> String {
    let mut line = format!(
        "{}   {}   RunId: {}; Run Name: {}; StepId: {}; Step Name: {}; Step Status: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        *HOST_NAME,
        step.run_id,
        step.run_name,
        step.step_id,
        step.step_name,
        step.status
    );

    if !message.trim().is_empty() {
        line.push_str("; Message: ");
        line.push_str(message);
    }

    line
}

/// Resolves the log route against `base` as a relative reference.
///
/// A last path segment without a trailing slash is replaced, so a peer's
/// run route `http://peer:5000/run` logs to
/// `http://peer:5000/api/distributor/log`.
pub fn log_endpoint(base: &str) -> String {
    match Url::parse(base.trim()).and_then(|url| url.join(LOG_ROUTE)) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{}/{}", base.trim_end_matches('/'), LOG_ROUTE),
    }
}

/// Client for one run's log sink.
#[derive(Clone)]
pub struct StepLog {
    http: reqwest::Client,
    endpoint: String,
}

impl StepLog {
    /// Creates a log client posting to the log route of `base`.
    pub fn new(http: reqwest::Client, base: &str) -> Self {
        Self {
            http,
            endpoint: log_endpoint(base),
        }
    }

    /// Returns the full URL lines are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Records the step's current status.
    pub async fn status(&self, step: &Step) {
        self.write(step, "").await;
    }

    /// Records a message against the step.
    pub async fn write(&self, step: &Step, message: &str) {
        let line = format_message(step, message);
        info!("{}", line);

        let result = self
            .http
            .post(&self.endpoint)
            .json(&line)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!("Log sink {} rejected entry: {}", self.endpoint, e);
        }
    }
}
