//! Process-global Prometheus metrics.
//!
//! All streaming metrics are registered once into a private registry and
//! accessed through [`metrics()`]. The optional exposition listener serves
//! the text format on `GET /metrics`.

use std::sync::OnceLock;

use axum::routing::get;
use axum::Router;
use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Handles for every metric the engine emits.
pub struct Metrics {
    registry: Registry,

    /// 1 while streaming playback is active for a call.
    pub streaming_active: IntGaugeVec,
    /// Bytes queued to streaming playback, pre-conversion.
    pub streaming_bytes_total: IntCounterVec,
    /// Outbound audio bytes actually sent to the caller.
    pub stream_tx_bytes_total: IntCounterVec,
    /// Times streaming fell back to file playback.
    pub streaming_fallbacks_total: IntCounterVec,
    /// Keepalive ticks observed while streaming.
    pub streaming_keepalives_sent_total: IntCounterVec,
    /// Keepalive-detected stream timeouts.
    pub streaming_keepalive_timeouts_total: IntCounterVec,
    /// Current jitter buffer depth in queued chunks.
    pub streaming_jitter_depth: IntGaugeVec,
    /// Underflow events (filler frames inserted).
    pub stream_underflow_events_total: IntCounterVec,
    /// Filler bytes injected on underflow.
    pub stream_filler_bytes_total: IntCounterVec,
    /// 20 ms frames actually sent.
    pub stream_frames_sent_total: IntCounterVec,
    /// Streaming segments started, by playback type.
    pub stream_started_total: IntCounterVec,
    /// Time from stream start to first outbound frame.
    pub stream_first_frame_seconds: HistogramVec,
    /// Streaming segment duration.
    pub stream_segment_duration_seconds: HistogramVec,
    /// Stream end reasons.
    pub stream_end_reason_total: IntCounterVec,
    /// PCM16 egress byte-order corrections applied automatically.
    pub stream_endian_corrections_total: IntCounterVec,
    /// Inbound RTP packets dropped by the echo filter.
    pub rtp_echo_filtered_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:expr, $help:expr, $labels:expr) => {{
                let vec = IntCounterVec::new(opts!($name, $help), $labels)
                    .expect("valid metric definition");
                registry
                    .register(Box::new(vec.clone()))
                    .expect("unique metric name");
                vec
            }};
        }
        macro_rules! gauge {
            ($name:expr, $help:expr, $labels:expr) => {{
                let vec = IntGaugeVec::new(opts!($name, $help), $labels)
                    .expect("valid metric definition");
                registry
                    .register(Box::new(vec.clone()))
                    .expect("unique metric name");
                vec
            }};
        }

        let stream_first_frame_seconds = HistogramVec::new(
            histogram_opts!(
                "ai_agent_stream_first_frame_seconds",
                "Time from stream start to first outbound frame",
                vec![0.05, 0.1, 0.2, 0.3, 0.5, 1.0, 2.0]
            ),
            &["call_id", "playback_type"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(stream_first_frame_seconds.clone()))
            .expect("unique metric name");

        let stream_segment_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "ai_agent_stream_segment_duration_seconds",
                "Streaming segment duration",
                vec![0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 15.0, 30.0]
            ),
            &["call_id", "playback_type"],
        )
        .expect("valid metric definition");
        registry
            .register(Box::new(stream_segment_duration_seconds.clone()))
            .expect("unique metric name");

        Self {
            streaming_active: gauge!(
                "ai_agent_streaming_active",
                "Whether streaming playback is active for a call (1 = active)",
                &["call_id"]
            ),
            streaming_bytes_total: counter!(
                "ai_agent_streaming_bytes_total",
                "Total bytes queued to streaming playback (pre-conversion)",
                &["call_id"]
            ),
            stream_tx_bytes_total: counter!(
                "ai_agent_stream_tx_bytes_total",
                "Outbound audio bytes sent to caller (per call)",
                &["call_id"]
            ),
            streaming_fallbacks_total: counter!(
                "ai_agent_streaming_fallbacks_total",
                "Number of times streaming fell back to file playback",
                &["call_id"]
            ),
            streaming_keepalives_sent_total: counter!(
                "ai_agent_streaming_keepalives_sent_total",
                "Count of keepalive ticks sent while streaming",
                &["call_id"]
            ),
            streaming_keepalive_timeouts_total: counter!(
                "ai_agent_streaming_keepalive_timeouts_total",
                "Count of keepalive-detected streaming timeouts",
                &["call_id"]
            ),
            streaming_jitter_depth: gauge!(
                "ai_agent_streaming_jitter_buffer_depth",
                "Current jitter buffer depth in queued chunks",
                &["call_id"]
            ),
            stream_underflow_events_total: counter!(
                "ai_agent_stream_underflow_events_total",
                "Underflow events (20ms fillers inserted)",
                &["call_id"]
            ),
            stream_filler_bytes_total: counter!(
                "ai_agent_stream_filler_bytes_total",
                "Filler bytes injected on underflow",
                &["call_id"]
            ),
            stream_frames_sent_total: counter!(
                "ai_agent_stream_frames_sent_total",
                "Frames (20ms) actually sent",
                &["call_id"]
            ),
            stream_started_total: counter!(
                "ai_agent_stream_started_total",
                "Number of streaming segments started",
                &["call_id", "playback_type"]
            ),
            stream_end_reason_total: counter!(
                "ai_agent_stream_end_reason_total",
                "Count of stream end reasons",
                &["call_id", "reason"]
            ),
            stream_endian_corrections_total: counter!(
                "ai_agent_stream_endian_corrections_total",
                "Count of PCM16 egress byte-order corrections applied automatically",
                &["call_id", "mode"]
            ),
            rtp_echo_filtered_total: counter!(
                "ai_agent_rtp_echo_packets_filtered_total",
                "Inbound RTP packets dropped because they carried our outbound SSRC",
                &["call_id"]
            ),
            stream_first_frame_seconds,
            stream_segment_duration_seconds,
            registry,
        }
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::warn!("[Metrics] Encoding failed: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Global metrics handle; initialized on first use.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Serves `GET /metrics` on the given address until the process exits.
///
/// Bind failures are logged and swallowed: metrics exposition is optional
/// and must never take down the engine.
pub async fn serve_metrics(bind: String) {
    let app = Router::new().route("/metrics", get(|| async { metrics().render() }));
    match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => {
            log::info!("[Metrics] Exposition listening on {bind}");
            if let Err(e) = axum::serve(listener, app).await {
                log::warn!("[Metrics] Server error: {e}");
            }
        }
        Err(e) => log::warn!("[Metrics] Bind failed on {bind}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_render() {
        let m = metrics();
        m.streaming_active.with_label_values(&["call-test"]).set(1);
        m.stream_frames_sent_total
            .with_label_values(&["call-test"])
            .inc();
        let text = m.render();
        assert!(text.contains("ai_agent_streaming_active"));
        assert!(text.contains("ai_agent_stream_frames_sent_total"));
    }

    #[test]
    fn end_reason_counter_accepts_arbitrary_reasons() {
        let m = metrics();
        m.stream_end_reason_total
            .with_label_values(&["call-test", "timeout>4s"])
            .inc();
        assert!(m.render().contains("timeout>4s"));
    }
}
