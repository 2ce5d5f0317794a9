//! Failure tracking, and the status check used for automation drivers.
//!
//! A single failed probe never fails a device on its own: the tracker
//! only reports `Unhealthy` once consecutive failures reach the
//! threshold, and one success resets the count.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use simfleet_exec::HealthProbe;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The check passed (expected answer, process alive, unit booted).
    Healthy,
    /// The check ran and reported a problem.
    Unhealthy,
    /// The check could not be executed at all.
    Failed,
}

impl From<bool> for ProbeResult {
    fn from(healthy: bool) -> Self {
        if healthy { Self::Healthy } else { Self::Unhealthy }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Consecutive-failure counter for one probe.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
}

impl HealthTracker {
    /// Tracker reporting `Unhealthy` after `unhealthy_threshold` failures in a row.
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe result and return the new status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                if self.status == HealthStatus::Unhealthy {
                    debug!(failures = self.consecutive_failures, "probe recovered");
                }
                self.consecutive_failures = 0;
                self.status = HealthStatus::Healthy;
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "probe crossed failure threshold"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    pub fn reset(&mut self) {
        self.status = HealthStatus::Unknown;
        self.consecutive_failures = 0;
    }
}

/// Why a status request produced no response.
#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("{0}")]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

/// `GET path` on a fresh HTTP/1 connection; returns status and full body.
async fn fetch(address: &str, path: &str) -> Result<(StatusCode, Bytes), FetchError> {
    let stream = TcpStream::connect(address).await?;
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    let connection = tokio::spawn(connection);

    let request = Request::get(path)
        .header(header::HOST, address)
        .header(header::ACCEPT, "application/json")
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    connection.abort();
    Ok((status, body))
}

/// Readiness check against an automation driver's status endpoint.
///
/// The driver is up when the endpoint answers the expected status and,
/// if a ready field is set, the JSON body holds `true` at that pointer.
#[derive(Debug, Clone)]
pub struct DriverStatusCheck {
    address: String,
    path: String,
    expected_status: StatusCode,
    ready_field: Option<String>,
    timeout: Duration,
}

impl DriverStatusCheck {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            expected_status: StatusCode::OK,
            ready_field: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_expected_status(mut self, status: StatusCode) -> Self {
        self.expected_status = status;
        self
    }

    /// JSON pointer (e.g. `/value/ready`) that must hold `true`.
    pub fn with_ready_field(mut self, pointer: impl Into<String>) -> Self {
        self.ready_field = Some(pointer.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `Failed` when no response arrives within the timeout.
    pub async fn check(&self) -> ProbeResult {
        match tokio::time::timeout(self.timeout, fetch(&self.address, &self.path)).await {
            Ok(Ok((status, body))) => self.evaluate(status, &body),
            Ok(Err(e)) => {
                debug!(address = %self.address, path = %self.path, error = %e, "driver status unavailable");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(address = %self.address, path = %self.path, timeout = ?self.timeout, "driver status timed out");
                ProbeResult::Failed
            }
        }
    }

    fn evaluate(&self, status: StatusCode, body: &[u8]) -> ProbeResult {
        if status != self.expected_status {
            debug!(address = %self.address, %status, expected = %self.expected_status, "driver answered unexpected status");
            return ProbeResult::Unhealthy;
        }
        let Some(pointer) = &self.ready_field else {
            return ProbeResult::Healthy;
        };
        let ready = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|json| json.pointer(pointer).and_then(Value::as_bool));
        if ready == Some(true) {
            ProbeResult::Healthy
        } else {
            debug!(address = %self.address, field = %pointer, ?ready, "driver not ready");
            ProbeResult::Unhealthy
        }
    }
}

#[async_trait]
impl HealthProbe for DriverStatusCheck {
    async fn is_healthy(&self) -> bool {
        self.check().await == ProbeResult::Healthy
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn tracker_starts_unknown() {
        let tracker = HealthTracker::new(4);
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn first_failure_is_absorbed() {
        let mut tracker = HealthTracker::new(4);
        tracker.record(ProbeResult::Healthy);
        assert_eq!(tracker.record(ProbeResult::Unhealthy), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn unhealthy_at_threshold() {
        let mut tracker = HealthTracker::new(3);
        tracker.record(ProbeResult::Failed);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.record(ProbeResult::Failed), HealthStatus::Unhealthy);
    }

    #[test]
    fn success_resets_the_count() {
        let mut tracker = HealthTracker::new(3);
        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Healthy);
        tracker.record(ProbeResult::Unhealthy);
        tracker.record(ProbeResult::Unhealthy);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);
    }

    #[test]
    fn zero_threshold_is_clamped() {
        let mut tracker = HealthTracker::new(0);
        assert_eq!(tracker.threshold(), 1);
        assert_eq!(tracker.record(ProbeResult::Failed), HealthStatus::Unhealthy);
        tracker.reset();
        assert_eq!(tracker.status(), HealthStatus::Unknown);
    }

    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        addr
    }

    fn wda(addr: String) -> DriverStatusCheck {
        DriverStatusCheck::new(addr, "/status")
            .with_ready_field("/value/ready")
            .with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn expected_status_is_healthy() {
        let addr = serve_once("HTTP/1.1 200 OK", "").await;
        let check =
            DriverStatusCheck::new(addr, "/wd/hub/status").with_timeout(Duration::from_secs(2));
        assert!(check.is_healthy().await);
    }

    #[tokio::test]
    async fn other_status_is_unhealthy() {
        let addr = serve_once("HTTP/1.1 503 Service Unavailable", "").await;
        let check = DriverStatusCheck::new(addr, "/status").with_timeout(Duration::from_secs(2));
        assert_eq!(check.check().await, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn non_default_expected_status() {
        let addr = serve_once("HTTP/1.1 204 No Content", "").await;
        let check = DriverStatusCheck::new(addr.clone(), "/status")
            .with_expected_status(StatusCode::NO_CONTENT)
            .with_timeout(Duration::from_secs(2));
        assert_eq!(check.check().await, ProbeResult::Healthy);

        // 2xx alone is not enough.
        let addr = serve_once("HTTP/1.1 204 No Content", "").await;
        let check = DriverStatusCheck::new(addr, "/status").with_timeout(Duration::from_secs(2));
        assert_eq!(check.check().await, ProbeResult::Unhealthy);
    }

    #[tokio::test]
    async fn ready_field_true_is_healthy() {
        let addr = serve_once(
            "HTTP/1.1 200 OK",
            r#"{"value":{"ready":true,"message":"WebDriverAgent is ready to accept commands"},"sessionId":null}"#,
        )
        .await;
        assert_eq!(wda(addr).check().await, ProbeResult::Healthy);
    }

    #[tokio::test]
    async fn ready_field_false_is_unhealthy() {
        let addr = serve_once("HTTP/1.1 200 OK", r#"{"value":{"ready":false}}"#).await;
        assert_eq!(wda(addr).check().await, ProbeResult::Unhealthy);
    }

    #[test]
    fn missing_or_malformed_ready_field_is_unhealthy() {
        let check = wda("127.0.0.1:1".into());
        assert_eq!(check.evaluate(StatusCode::OK, b"{\"value\":{}}"), ProbeResult::Unhealthy);
        assert_eq!(check.evaluate(StatusCode::OK, b"{\"value\":{\"ready\":\"yes\"}}"), ProbeResult::Unhealthy);
        assert_eq!(check.evaluate(StatusCode::OK, b"<html>"), ProbeResult::Unhealthy);
        assert_eq!(
            check.evaluate(StatusCode::OK, b"{\"value\":{\"ready\":true}}"),
            ProbeResult::Healthy
        );
        assert_eq!(
            check.evaluate(StatusCode::BAD_GATEWAY, b"{\"value\":{\"ready\":true}}"),
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn failed_when_nothing_listens() {
        let check =
            DriverStatusCheck::new("127.0.0.1:1", "/status").with_timeout(Duration::from_millis(500));
        assert_eq!(check.check().await, ProbeResult::Failed);
    }
}
