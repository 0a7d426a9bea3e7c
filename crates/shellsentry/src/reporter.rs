//! Failure report delivery.
//!
//! [`FailureReporter`] is the seam between the retry flow and the crash
//! aggregation service. Delivery is best-effort: callers log errors and move
//! on, so a dead reporting backend never changes a build's outcome.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use shellsentry_core::report::MetadataTabs;
use shellsentry_core::FailureReport;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Bugsnag event ingestion endpoint.
pub const BUGSNAG_ENDPOINT: &str = "https://notify.bugsnag.com";
const PAYLOAD_VERSION: &str = "4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid api key header value")]
    InvalidApiKey,
    #[error("report rejected: {status} - {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers failure reports somewhere durable.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, report: &FailureReport) -> Result<(), ReportError>;
}

/// Used when no API key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledReporter;

#[async_trait]
impl FailureReporter for DisabledReporter {
    async fn report(&self, report: &FailureReport) -> Result<(), ReportError> {
        debug!(
            grouping_hash = %report.grouping_hash,
            "reporting disabled; skipping failure report"
        );
        Ok(())
    }
}

/// Sends reports to Bugsnag as v4 error events.
#[derive(Debug, Clone)]
pub struct BugsnagReporter {
    endpoint: String,
    headers: HeaderMap,
    http: reqwest::Client,
}

impl BugsnagReporter {
    pub fn new(api_key: &str) -> Result<Self, ReportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Bugsnag-Api-Key",
            HeaderValue::from_str(api_key).map_err(|_| ReportError::InvalidApiKey)?,
        );
        headers.insert(
            "Bugsnag-Payload-Version",
            HeaderValue::from_static(PAYLOAD_VERSION),
        );

        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            endpoint: BUGSNAG_ENDPOINT.to_string(),
            headers,
            http,
        })
    }

    /// Point the reporter at a different ingestion URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn api_key(&self) -> &str {
        self.headers
            .get("Bugsnag-Api-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FailureReporter for BugsnagReporter {
    async fn report(&self, report: &FailureReport) -> Result<(), ReportError> {
        let sent_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let payload = event_payload(self.api_key(), report, &sent_at);

        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header("Bugsnag-Sent-At", &sent_at)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            grouping_hash = %report.grouping_hash,
            status = status.as_u16(),
            "failure report delivered"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload<'a> {
    api_key: &'a str,
    payload_version: &'static str,
    notifier: Notifier,
    events: Vec<Event<'a>>,
}

#[derive(Debug, Serialize)]
struct Notifier {
    name: &'static str,
    version: &'static str,
    url: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Event<'a> {
    exceptions: Vec<Exception<'a>>,
    severity: &'static str,
    unhandled: bool,
    severity_reason: SeverityReason,
    grouping_hash: &'a str,
    app: App<'a>,
    device: Device<'a>,
    meta_data: &'a MetadataTabs,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Exception<'a> {
    error_class: &'a str,
    message: &'a str,
    stacktrace: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct SeverityReason {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct App<'a> {
    version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_stage: Option<&'static str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Device<'a> {
    os_name: &'static str,
    time: &'a str,
}

/// Build the Bugsnag v4 request body for a single report.
fn event_payload<'a>(api_key: &'a str, report: &'a FailureReport, time: &'a str) -> Payload<'a> {
    Payload {
        api_key,
        payload_version: PAYLOAD_VERSION,
        notifier: Notifier {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            url: "https://www.bugsnag.com",
        },
        events: vec![Event {
            exceptions: vec![Exception {
                error_class: &report.error_class,
                message: &report.message,
                stacktrace: Vec::new(),
            }],
            severity: "error",
            unhandled: false,
            severity_reason: SeverityReason {
                kind: "handledException",
            },
            grouping_hash: &report.grouping_hash,
            app: App {
                version: &report.app_version,
                release_stage: report.release_stage.map(|s| s.as_str()),
                kind: report.app_type.as_deref(),
            },
            device: Device {
                os_name: std::env::consts::OS,
                time,
            },
            meta_data: &report.metadata,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shellsentry_core::report::TAB_RUN_INFO;
    use shellsentry_core::{CiContext, Issue, RetryPolicy, RetrySignal};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn sample_report() -> FailureReport {
        let issue = Issue::new(
            "Generic OOM",
            "Detected OOM. Retrying immediately.",
            "Java heap space",
            "oom",
            RetryPolicy::Immediate,
        );
        let ctx = CiContext::from_lookup(|key| match key {
            "BUILDKITE_STEP_KEY" => Some("unit-tests".to_string()),
            "BUILDKITE_BRANCH" => Some("main".to_string()),
            _ => None,
        });
        FailureReport::new(&issue, &RetrySignal::RetryImmediately(issue.clone()))
            .with_command("./gradlew test")
            .with_context(&ctx)
    }

    /// Accept one HTTP request, reply with `status`, and return (head, body).
    async fn serve_once(status: u16) -> (String, JoinHandle<(String, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < header_end + len {
                let n = stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before body");
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = String::from_utf8_lossy(&buf[header_end..header_end + len]).to_string();

            let response =
                format!("HTTP/1.1 {status} Status\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope");
            stream.write_all(response.as_bytes()).await.unwrap();
            (head, body)
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn payload_has_bugsnag_shape() {
        let report = sample_report();
        let payload = event_payload("secret", &report, "2024-01-01T00:00:00.000Z");
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["apiKey"], "secret");
        assert_eq!(json["notifier"]["name"], "shellsentry");
        let event = &json["events"][0];
        assert_eq!(event["exceptions"][0]["errorClass"], "Generic OOM");
        assert_eq!(
            event["exceptions"][0]["message"],
            "Detected OOM. Retrying immediately."
        );
        assert_eq!(event["exceptions"][0]["stacktrace"], serde_json::json!([]));
        assert_eq!(event["severity"], "error");
        assert_eq!(event["unhandled"], false);
        assert_eq!(event["severityReason"]["type"], "handledException");
        assert_eq!(event["groupingHash"], "oom");
        assert_eq!(event["app"]["releaseStage"], "main");
        assert_eq!(event["app"]["type"], "unit-tests");
        assert_eq!(event["device"]["time"], "2024-01-01T00:00:00.000Z");
        assert_eq!(event["metaData"][TAB_RUN_INFO]["Command"], "./gradlew test");
        assert_eq!(event["metaData"][TAB_RUN_INFO]["After-Retry"], false);
    }

    #[test]
    fn payload_omits_missing_app_fields() {
        let issue = Issue::new("m", "l", "t", "g", RetryPolicy::Ack);
        let report = FailureReport::new(&issue, &RetrySignal::Ack(issue.clone()));
        let json = serde_json::to_value(event_payload("k", &report, "t")).unwrap();
        let app = json["events"][0]["app"].as_object().unwrap();
        assert!(!app.contains_key("releaseStage"));
        assert!(!app.contains_key("type"));
    }

    #[test]
    fn rejects_api_key_with_newline() {
        assert!(matches!(
            BugsnagReporter::new("bad\nkey"),
            Err(ReportError::InvalidApiKey)
        ));
    }

    #[tokio::test]
    async fn disabled_reporter_is_a_no_op() {
        assert!(DisabledReporter.report(&sample_report()).await.is_ok());
    }

    #[tokio::test]
    async fn bugsnag_reporter_posts_event() {
        let (url, server) = serve_once(200).await;
        let reporter = BugsnagReporter::new("secret").unwrap().with_endpoint(&url);
        assert_eq!(reporter.endpoint(), url);

        reporter.report(&sample_report()).await.unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("post / "));
        assert!(head.contains("bugsnag-api-key: secret"));
        assert!(head.contains("bugsnag-payload-version: 4"));
        assert!(head.contains("bugsnag-sent-at: "));
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["events"][0]["groupingHash"], "oom");
    }

    #[tokio::test]
    async fn bugsnag_reporter_surfaces_rejection() {
        let (url, server) = serve_once(400).await;
        let reporter = BugsnagReporter::new("secret").unwrap().with_endpoint(url);

        let result = reporter.report(&sample_report()).await;
        server.await.unwrap();
        match result {
            Err(ReportError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "nope");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }
}
