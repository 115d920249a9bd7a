//! Telemetry emission: CloudEvents 1.0 envelopes over HTTPS.
//!
//! One `coredog.coredump.uploaded` event per validated upload. The bearer
//! token travels both in the `Authorization` header and duplicated in the
//! envelope body. Emission failures are logged by the caller and never
//! abort the pipeline.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Request timeout for the telemetry POST.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// CloudEvents spec version emitted.
const SPEC_VERSION: &str = "1.0";

/// Event type for a successfully uploaded core dump.
const EVENT_TYPE: &str = "coredog.coredump.uploaded";

/// Event source identifying this agent.
const EVENT_SOURCE: &str = "coredog-agent";

/// Errors that can occur while emitting telemetry.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to send telemetry request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telemetry endpoint returned status {0}")]
    Status(u16),
}

/// CloudEvents 1.0 envelope.
#[derive(Debug, Serialize)]
struct CloudEvent<'a> {
    specversion: &'static str,
    #[serde(rename = "type")]
    event_type: &'static str,
    source: &'static str,
    id: String,
    time: String,
    datacontenttype: &'static str,
    #[serde(skip_serializing_if = "str::is_empty")]
    token: &'a str,
    data: &'a CoredumpUploadedData,
}

/// Payload of a `coredog.coredump.uploaded` event.
#[derive(Debug, Clone, Serialize)]
pub struct CoredumpUploadedData {
    pub file_url: String,
    pub file_name: String,
    pub executable_path: String,
    pub file_size: u64,
    pub md5: String,
    pub image: String,
    pub timestamp: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub node_ip: String,
}

/// Publishes coredump events to the telemetry bus.
pub struct Reporter {
    client: Client,
    url: String,
    token: String,
}

impl Reporter {
    pub fn new(url: String, token: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, url, token }
    }

    /// POST one event envelope; non-2xx responses are failures.
    pub async fn report_coredump_uploaded(
        &self,
        data: &CoredumpUploadedData,
    ) -> Result<(), ReportError> {
        let event = CloudEvent {
            specversion: SPEC_VERSION,
            event_type: EVENT_TYPE,
            source: EVENT_SOURCE,
            id: event_id(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            datacontenttype: "application/json",
            token: &self.token,
            data,
        };

        let mut request = self.client.post(&self.url).json(&event);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(ReportError::Status(resp.status().as_u16()));
        }

        info!(
            event_id = %event.id,
            file_url = %data.file_url,
            "telemetry event reported"
        );
        Ok(())
    }
}

fn event_id() -> String {
    format!("coredog-{}-{}", Utc::now().timestamp(), std::process::id())
}
