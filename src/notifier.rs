//! Alert delivery to a webhook sink
//!
//! The engine hands messages to [`Notifier::notify`], which only enqueues.
//! A single background task drains the queue and performs the HTTP calls,
//! so a slow or failing sink never stalls a poll cycle and alerts keep the
//! order in which they were raised.

use crate::errors::{MonitorError, Result};
use crate::targets::Target;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, Response};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Messages waiting for delivery before new ones are dropped
const QUEUE_CAPACITY: usize = 256;

/// Destination for alert text
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, message: &str) -> Result<()>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to a webhook (Slack, Teams, Discord, ...)
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String, http_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("pingwatch/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(MonitorError::Http)?;

        Ok(Self { client, url })
    }

    async fn handle_response(&self, response: Response) -> Result<()> {
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let message = match status.as_u16() {
            400 => format!("Webhook rejected the payload: {}", body),
            401 | 403 => format!("Webhook refused authorization ({}): {}", status, body),
            404 => format!("Webhook endpoint not found: {}", body),
            429 => format!("Webhook rate limited: {}", body),
            500..=599 => format!("Webhook server error {}: {}", status, body),
            _ => format!("Unexpected webhook response {}: {}", status, body),
        };

        Err(MonitorError::Transport(message))
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn send(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { text: message })
            .send()
            .await?;

        self.handle_response(response).await
    }
}

/// Delivery counters for the periodic self-report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub dropped: u64,
    pub last_duration_ms: Option<u64>,
}

/// Fire-and-forget front of the alert sink
#[derive(Clone)]
pub struct Notifier {
    queue: Option<mpsc::Sender<String>>,
    metrics: Arc<RwLock<DeliveryMetrics>>,
    warned_disabled: Arc<AtomicBool>,
}

impl Notifier {
    /// Start the delivery task for `sink`; `None` makes every notify a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Option<Arc<dyn AlertSink>>) -> Self {
        let metrics = Arc::new(RwLock::new(DeliveryMetrics::default()));

        let queue = sink.map(|sink| {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            tokio::spawn(deliver(sink, rx, Arc::clone(&metrics)));
            tx
        });

        Self {
            queue,
            metrics,
            warned_disabled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Notifier that never sends anything
    pub fn disabled() -> Self {
        Self::spawn(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Enqueue a message for delivery without waiting for it
    pub fn notify(&self, message: String) {
        let Some(queue) = &self.queue else {
            if !self.warned_disabled.swap(true, Ordering::Relaxed) {
                warn!("No WEBHOOK_URL set, notifications are disabled");
            }
            debug!("Dropping notification: {}", message);
            return;
        };

        if let Err(e) = queue.try_send(message) {
            warn!("Notification queue unavailable, dropping message: {}", e);
            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                metrics.write().await.dropped += 1;
            });
        }
    }

    pub async fn metrics(&self) -> DeliveryMetrics {
        self.metrics.read().await.clone()
    }
}

/// Drain the queue; each message gets exactly one delivery attempt
async fn deliver(
    sink: Arc<dyn AlertSink>,
    mut rx: mpsc::Receiver<String>,
    metrics: Arc<RwLock<DeliveryMetrics>>,
) {
    while let Some(message) = rx.recv().await {
        let started = Instant::now();
        let result = sink.send(&message).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut metrics = metrics.write().await;
        metrics.attempts += 1;
        metrics.last_duration_ms = Some(elapsed_ms);

        match result {
            Ok(()) => {
                metrics.successes += 1;
                info!("Notification delivered in {}ms", elapsed_ms);
            }
            Err(e) => {
                metrics.failures += 1;
                error!("Notification delivery failed: {}", e);
            }
        }
    }

    debug!("Notification queue closed");
}

pub fn alert_message(target: &Target, grace_period: TimeDelta) -> String {
    format!(
        "ALERT: {} ({}) has been DOWN for {}",
        target.hostname,
        target.address,
        format_duration(grace_period)
    )
}

pub fn recovery_message(target: &Target, outage: TimeDelta) -> String {
    format!(
        "RECOVERY: {} ({}) is back UP after {}",
        target.hostname,
        target.address,
        format_duration(outage)
    )
}

/// Daily summary. An empty `down` list yields the all-clear message.
pub fn digest_message(down: &[(Target, Option<DateTime<Utc>>)]) -> String {
    if down.is_empty() {
        return "Daily summary: all hosts are UP".to_string();
    }

    let mut message = format!("Daily summary: {} host(s) DOWN", down.len());
    for (target, since) in down {
        message.push_str(&format!("\n- {} ({})", target.hostname, target.address));
        if let Some(since) = since {
            message.push_str(&format!(" down since {}", since.format("%Y-%m-%d %H:%M:%S UTC")));
        }
    }
    message
}

/// Compact human duration: `45s`, `5m`, `2h 5m`, `3d 4h`
pub fn format_duration(duration: TimeDelta) -> String {
    let total = duration.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );

    match (days, hours, minutes) {
        (0, 0, 0) => format!("{}s", seconds),
        (0, 0, m) if seconds == 0 => format!("{}m", m),
        (0, 0, m) => format!("{}m {}s", m, seconds),
        (0, h, m) => format!("{}h {}m", h, m),
        (d, h, _) => format!("{}d {}h", d, h),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn wait_for_attempts(notifier: &Notifier, attempts: u64) -> DeliveryMetrics {
        for _ in 0..100 {
            let metrics = notifier.metrics().await;
            if metrics.attempts >= attempts {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        notifier.metrics().await
    }

    #[tokio::test]
    async fn test_webhook_posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({"text": "ALERT: web1 (10.0.0.1)"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(format!("{}/hook", server.uri()), Duration::from_secs(2)).unwrap();
        tokio_test::assert_ok!(sink.send("ALERT: web1 (10.0.0.1)").await);
    }

    #[tokio::test]
    async fn test_webhook_non_success_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri(), Duration::from_secs(2)).unwrap();
        let err = sink.send("hello").await.unwrap_err();

        assert!(matches!(err, MonitorError::Transport(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_failed_delivery_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri(), Duration::from_secs(2)).unwrap();
        let notifier = Notifier::spawn(Some(Arc::new(sink)));
        notifier.notify("ALERT: db1 (10.0.0.2)".to_string());

        let metrics = wait_for_attempts(&notifier, 1).await;
        assert_eq!(metrics.attempts, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.successes, 0);
    }

    #[tokio::test]
    async fn test_notifier_delivers_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri(), Duration::from_secs(2)).unwrap();
        let notifier = Notifier::spawn(Some(Arc::new(sink)));
        notifier.notify("first".to_string());
        notifier.notify("second".to_string());

        let metrics = wait_for_attempts(&notifier, 2).await;
        assert_eq!(metrics.successes, 2);

        let received = server.received_requests().await.unwrap();
        let texts: Vec<String> = received
            .iter()
            .map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["text"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(TimeDelta::seconds(45)), "45s");
        assert_eq!(format_duration(TimeDelta::seconds(300)), "5m");
        assert_eq!(format_duration(TimeDelta::seconds(330)), "5m 30s");
        assert_eq!(format_duration(TimeDelta::seconds(7_500)), "2h 5m");
        assert_eq!(format_duration(TimeDelta::seconds(273_600)), "3d 4h");
        assert_eq!(format_duration(TimeDelta::seconds(-3)), "0s");
    }

    #[test]
    fn test_message_formats() {
        let web = Target::new("web1", "10.0.0.1");
        assert_eq!(
            alert_message(&web, TimeDelta::seconds(300)),
            "ALERT: web1 (10.0.0.1) has been DOWN for 5m"
        );
        assert_eq!(
            recovery_message(&web, TimeDelta::seconds(6)),
            "RECOVERY: web1 (10.0.0.1) is back UP after 6s"
        );
    }

    #[test]
    fn test_digest_message() {
        assert_eq!(digest_message(&[]), "Daily summary: all hosts are UP");

        let since = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 8, 30, 0).unwrap();
        let digest = digest_message(&[
            (Target::new("web1", "10.0.0.1"), Some(since)),
            (Target::new("db1", "10.0.0.2"), None),
        ]);

        assert_eq!(
            digest,
            "Daily summary: 2 host(s) DOWN\n\
             - web1 (10.0.0.1) down since 2024-03-01 08:30:00 UTC\n\
             - db1 (10.0.0.2)"
        );
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());

        notifier.notify("nobody listens".to_string());
        notifier.notify("still nobody".to_string());

        assert_eq!(notifier.metrics().await, DeliveryMetrics::default());
    }
}
