//! Crash notification formatting and chat dispatch.
//!
//! A fixed set of `{placeholder}` substitutions is applied to the
//! operator's template, then the message is POSTed to each configured
//! webhook whose keyword (if any) appears in the core-file path.
//! Sink failures are logged and never abort the pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};

use coredog_common::{host_ip, NoticeChannel, PodIdentity};

/// Request timeout for chat webhook calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatches formatted crash notifications to chat channels.
pub struct Notifier {
    channels: Vec<NoticeChannel>,
    template: String,
    labels: HashMap<String, String>,
    client: Client,
}

impl Notifier {
    pub fn new(
        channels: Vec<NoticeChannel>,
        template: String,
        labels: HashMap<String, String>,
    ) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            channels,
            template,
            labels,
            client,
        }
    }

    /// Send a pre-rendered message to every channel, bypassing template
    /// and keyword handling. Used for operational alerts.
    pub async fn send_raw(&self, message: &str) {
        if self.channels.is_empty() {
            warn!("no notice channels configured, dropping alert");
            return;
        }
        for channel in &self.channels {
            let body = match channel.channel.as_str() {
                "wechat" => json!({"msgtype": "text", "text": {"content": message}}),
                "slack" => json!({"text": message}),
                other => {
                    warn!(channel = other, "unsupported notice channel");
                    continue;
                }
            };
            match self.client.post(&channel.webhook_url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(channel = %channel.channel, "alert sent");
                }
                Ok(resp) => {
                    error!(channel = %channel.channel, status = %resp.status(), "alert webhook returned non-2xx");
                }
                Err(e) => {
                    error!(channel = %channel.channel, error = %e, "failed to send alert");
                }
            }
        }
    }

    /// Send the rendered message to every matching channel.
    pub async fn notify(&self, corefile_path: &Path, url: &str, pod: &PodIdentity) {
        for channel in &self.channels {
            if !keyword_matches(&channel.keyword, corefile_path) {
                continue;
            }

            let message = render_template(
                &self.template,
                &self.labels,
                corefile_path,
                url,
                pod,
                &host_ip(),
            );
            let body = match channel.channel.as_str() {
                "wechat" => json!({"msgtype": "text", "text": {"content": message}}),
                "slack" => json!({"text": message}),
                other => {
                    warn!(channel = other, "unsupported notice channel");
                    continue;
                }
            };

            match self.client.post(&channel.webhook_url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(channel = %channel.channel, "notification sent");
                }
                Ok(resp) => {
                    error!(
                        channel = %channel.channel,
                        status = %resp.status(),
                        "notification webhook returned non-2xx"
                    );
                }
                Err(e) => {
                    error!(channel = %channel.channel, error = %e, "failed to send notification");
                }
            }
        }
    }
}

/// A channel with a keyword only fires for paths containing it.
fn keyword_matches(keyword: &str, corefile_path: &Path) -> bool {
    keyword.is_empty() || corefile_path.to_string_lossy().contains(keyword)
}

/// Substitute operator labels and the built-in placeholders into the
/// message template.
pub fn render_template(
    template: &str,
    labels: &HashMap<String, String>,
    corefile_path: &Path,
    url: &str,
    pod: &PodIdentity,
    host_ip: &str,
) -> String {
    let mut msg = template.to_string();
    for (key, value) in labels {
        msg = msg.replace(&format!("{{{key}}}"), value);
    }

    let filename = corefile_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    msg = msg.replace("{corefile.path}", &corefile_path.to_string_lossy());
    msg = msg.replace("{corefile.filename}", &filename);
    msg = msg.replace("{corefile.url}", url);
    msg = msg.replace("{pod.name}", &pod.display_name());
    msg = msg.replace("{pod.namespace}", &pod.namespace);
    msg = msg.replace("{pod.uid}", &pod.pod_uid);
    msg = msg.replace("{pod.node}", &pod.node_ip);
    msg = msg.replace("{host.ip}", host_ip);
    msg
}
