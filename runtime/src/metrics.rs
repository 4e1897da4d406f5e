//! Prometheus metrics for the relay.
//!
//! Counters and histograms are emitted through the `metrics` facade from the
//! consumer, dispatcher and connection manager. Nothing is recorded unless a
//! recorder is installed, e.g. with [`MetricsServer::start`], which also serves
//! the Prometheus text format over HTTP on the configured address.
//!
//! # Example
//!
//! ```rust,no_run
//! use wa_relay_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // curl http://localhost:9090/metrics
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use wa_relay_core::AckDecision;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter with an HTTP scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
    listener: Option<JoinHandle<()>>,
}

impl MetricsServer {
    /// Create a new metrics server for the given scrape address.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handle: None,
            listener: None,
        }
    }

    /// Describe all metrics, install the Prometheus recorder and start
    /// serving it on the scrape address.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built (including
    /// when the address cannot be bound). A recorder that is already installed
    /// (e.g. by another test) is not an error; nothing is served in that case.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        self.listener = Some(tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(addr = %addr, error = ?e, "Metrics endpoint stopped");
            }
        }));
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Prometheus metrics available at /metrics");
        Ok(())
    }

    /// The address metrics are scraped from.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn register_metrics() {
    describe_counter!(
        "relay_messages_received_total",
        "Deliveries received from the broker"
    );
    describe_counter!(
        "relay_messages_acked_total",
        "Deliveries acknowledged"
    );
    describe_counter!(
        "relay_messages_nacked_total",
        "Deliveries rejected, labelled by requeue"
    );
    describe_counter!(
        "relay_dispatch_failures_total",
        "Failed dispatches, labelled by failure kind"
    );
    describe_histogram!(
        "relay_dispatch_duration_seconds",
        "Time taken to dispatch one delivery"
    );
    describe_counter!(
        "relay_handler_failures_total",
        "Handler invocations that failed or panicked"
    );
    describe_gauge!(
        "relay_in_flight_messages",
        "Deliveries currently being processed"
    );
    describe_counter!(
        "relay_reconnect_attempts_total",
        "Broker connection attempts made while reconnecting"
    );
    describe_gauge!(
        "relay_connected",
        "1 while the broker connection is up, 0 otherwise"
    );
}

/// Consumer-side recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// A delivery was received.
    pub fn record_received() {
        counter!("relay_messages_received_total").increment(1);
    }

    /// A delivery was settled.
    pub fn record_settled(decision: AckDecision) {
        match decision {
            AckDecision::Ack => counter!("relay_messages_acked_total").increment(1),
            AckDecision::Nack { requeue } => {
                counter!("relay_messages_nacked_total", "requeue" => requeue.to_string())
                    .increment(1);
            }
        }
    }

    /// A delivery entered the processing region.
    pub fn record_started() {
        gauge!("relay_in_flight_messages").increment(1.0);
    }

    /// A delivery left the processing region.
    pub fn record_finished() {
        gauge!("relay_in_flight_messages").decrement(1.0);
    }
}

/// Dispatcher-side recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record one dispatch.
    pub fn record_dispatch(event_type: &str, duration: Duration) {
        histogram!("relay_dispatch_duration_seconds", "event_type" => event_type.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a failed dispatch.
    pub fn record_failure(kind: &'static str) {
        counter!("relay_dispatch_failures_total", "kind" => kind).increment(1);
    }

    /// Record a failed handler.
    pub fn record_handler_failure(event_type: &'static str) {
        counter!("relay_handler_failures_total", "event_type" => event_type).increment(1);
    }
}

/// Connection-side recorder.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record one reconnect attempt.
    pub fn record_reconnect_attempt() {
        counter!("relay_reconnect_attempts_total").increment(1);
    }

    /// Record the connection flag.
    pub fn record_connected(connected: bool) {
        gauge!("relay_connected").set(if connected { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn serves_recorded_metrics_over_http() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ConsumerMetrics::record_received();
        ConsumerMetrics::record_settled(AckDecision::REQUEUE);
        DispatchMetrics::record_dispatch("Message", Duration::from_millis(3));

        let rendered = server.render().unwrap();
        assert!(rendered.contains("relay_messages_received_total"));
        assert!(rendered.contains("relay_messages_nacked_total"));

        let mut response = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = tokio::net::TcpStream::connect(addr).await {
                stream
                    .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                stream.read_to_string(&mut response).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("relay_messages_received_total"));
    }
}
