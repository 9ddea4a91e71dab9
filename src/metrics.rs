//! Prometheus metrics for the retrieval engine.
//!
//! Exposes:
//! - `forum_graphrag_command_duration_seconds` (histogram)
//! - `forum_graphrag_command_total` (counter with status)
//! - `forum_graphrag_command_inflight` (gauge)
//! - ingest, query, and store-error counters
//! - process metrics via `process` collector

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge_vec, Encoder, Histogram, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::ingest::IngestSummary;

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static COMMAND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // Exponential buckets from 50ms up to ~3 minutes.
    let buckets =
        prometheus::exponential_buckets(0.05, 2.0, 14).expect("failed to create histogram buckets");
    register_histogram_vec!(
        "forum_graphrag_command_duration_seconds",
        "CLI command duration in seconds",
        &["command"],
        buckets
    )
    .expect("failed to register command duration histogram")
});

static COMMAND_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "forum_graphrag_command_total",
        "Total command executions by status",
        &["command", "status"]
    )
    .expect("failed to register command counter")
});

static COMMAND_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "forum_graphrag_command_inflight",
        "Number of in-flight commands",
        &["command"]
    )
    .expect("failed to register inflight gauge")
});

static INGEST_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "forum_graphrag_ingest_records_total",
        "Ingested records by outcome",
        &["outcome"]
    )
    .expect("failed to register ingest record counter")
});

static INGEST_TRIPLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "forum_graphrag_ingest_triples_total",
        "Extracted triples by sanitation status",
        &["status"]
    )
    .expect("failed to register ingest triple counter")
});

static DEFERRED_REPLIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "forum_graphrag_deferred_replies_total",
        "Reply links parked waiting for their parent post"
    )
    .expect("failed to register deferred reply counter")
});

static QUERY_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "forum_graphrag_query_total",
        "Retrieval queries by status",
        &["status"]
    )
    .expect("failed to register query counter")
});

static QUERY_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let buckets =
        prometheus::exponential_buckets(0.01, 2.0, 12).expect("failed to create histogram buckets");
    register_histogram!(
        "forum_graphrag_query_duration_seconds",
        "End-to-end retrieval latency in seconds",
        buckets
    )
    .expect("failed to register query duration histogram")
});

static STORE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "forum_graphrag_store_errors_total",
        "Store failures surfaced to the caller",
        &["store"]
    )
    .expect("failed to register store error counter")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&COMMAND_DURATION);
    Lazy::force(&COMMAND_TOTAL);
    Lazy::force(&COMMAND_INFLIGHT);
    Lazy::force(&INGEST_RECORDS);
    Lazy::force(&INGEST_TRIPLES);
    Lazy::force(&DEFERRED_REPLIES);
    Lazy::force(&QUERY_TOTAL);
    Lazy::force(&QUERY_DURATION);
    Lazy::force(&STORE_ERRORS);
}

/// Increment inflight gauge for a command.
pub fn record_command_start(command: &'static str) {
    init_collectors();
    COMMAND_INFLIGHT.with_label_values(&[command]).inc();
}

/// Record command completion with duration and status.
pub fn record_command_result(command: &'static str, duration: Duration, success: bool) {
    init_collectors();
    COMMAND_INFLIGHT.with_label_values(&[command]).dec();
    COMMAND_DURATION
        .with_label_values(&[command])
        .observe(duration.as_secs_f64());
    COMMAND_TOTAL
        .with_label_values(&[command, if success { "ok" } else { "error" }])
        .inc();
}

/// Fold one batch summary into the ingest counters.
pub fn record_ingest_summary(summary: &IngestSummary) {
    init_collectors();
    INGEST_RECORDS
        .with_label_values(&["created"])
        .inc_by(summary.ingested as u64);
    INGEST_RECORDS
        .with_label_values(&["unchanged"])
        .inc_by(summary.unchanged as u64);
    INGEST_RECORDS
        .with_label_values(&["new_version"])
        .inc_by(summary.new_versions as u64);
    INGEST_RECORDS
        .with_label_values(&["skipped"])
        .inc_by(summary.skipped as u64);
    INGEST_RECORDS
        .with_label_values(&["failed"])
        .inc_by(summary.failed as u64);
    INGEST_TRIPLES
        .with_label_values(&["accepted"])
        .inc_by(summary.triples_accepted as u64);
    INGEST_TRIPLES
        .with_label_values(&["discarded"])
        .inc_by(summary.triples_discarded as u64);
    DEFERRED_REPLIES.inc_by(summary.deferred_replies as u64);
}

/// Record one retrieval query. Partial responses count separately so
/// expansion losses are visible on a dashboard.
pub fn record_query(duration: Duration, partial: bool, success: bool) {
    init_collectors();
    QUERY_DURATION.observe(duration.as_secs_f64());
    let status = match (success, partial) {
        (false, _) => "error",
        (true, true) => "partial",
        (true, false) => "ok",
    };
    QUERY_TOTAL.with_label_values(&[status]).inc();
}

/// Count a store failure against the named backend.
pub fn record_store_error(store: &'static str) {
    init_collectors();
    STORE_ERRORS.with_label_values(&[store]).inc();
}

async fn metrics_response() -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        return Ok(Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Full::from("encode error"))
            .unwrap());
    }

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, encoder.format_type())
        .body(Full::from(buffer))
        .unwrap())
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => metrics_response().await,
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::from("ok"))
            .unwrap()),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()),
    }
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service_fn(handle_request);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(?peer, "Metrics connection error: {}", err);
            }
        });
    }
}

/// Spawn the metrics HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    init_collectors();
    tokio::spawn(async move {
        if let Err(err) = serve(addr).await {
            error!(%addr, "Metrics server failed: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn records_successful_command_metrics() {
        let cmd = "test_command_metrics_success";

        record_command_start(cmd);
        assert_eq!(COMMAND_INFLIGHT.with_label_values(&[cmd]).get(), 1);

        record_command_result(cmd, Duration::from_millis(120), true);

        assert_eq!(COMMAND_INFLIGHT.with_label_values(&[cmd]).get(), 0);
        assert_eq!(COMMAND_TOTAL.with_label_values(&[cmd, "ok"]).get(), 1);
        assert_eq!(
            COMMAND_DURATION
                .with_label_values(&[cmd])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn records_failed_command_metrics() {
        let cmd = "test_command_metrics_error";

        record_command_start(cmd);
        record_command_result(cmd, Duration::from_secs(2), false);

        assert_eq!(COMMAND_TOTAL.with_label_values(&[cmd, "error"]).get(), 1);
        assert_eq!(
            COMMAND_DURATION
                .with_label_values(&[cmd])
                .get_sample_count(),
            1
        );
    }

    #[test]
    fn ingest_summary_feeds_the_counters() {
        let before_created = INGEST_RECORDS.with_label_values(&["created"]).get();
        let before_triples = INGEST_TRIPLES.with_label_values(&["accepted"]).get();

        record_ingest_summary(&IngestSummary {
            ingested: 4,
            unchanged: 2,
            new_versions: 1,
            skipped: 1,
            failed: 0,
            deferred_replies: 3,
            triples_accepted: 7,
            triples_discarded: 2,
        });

        assert_eq!(
            INGEST_RECORDS.with_label_values(&["created"]).get(),
            before_created + 4
        );
        assert_eq!(
            INGEST_TRIPLES.with_label_values(&["accepted"]).get(),
            before_triples + 7
        );
    }

    #[test]
    fn partial_queries_count_separately() {
        let before_ok = QUERY_TOTAL.with_label_values(&["ok"]).get();
        let before_partial = QUERY_TOTAL.with_label_values(&["partial"]).get();

        record_query(Duration::from_millis(25), false, true);
        record_query(Duration::from_millis(40), true, true);

        assert_eq!(QUERY_TOTAL.with_label_values(&["ok"]).get(), before_ok + 1);
        assert_eq!(
            QUERY_TOTAL.with_label_values(&["partial"]).get(),
            before_partial + 1
        );
    }

    #[test]
    fn store_errors_count_per_backend() {
        let before = STORE_ERRORS.with_label_values(&["neo4j"]).get();
        record_store_error("neo4j");
        assert_eq!(STORE_ERRORS.with_label_values(&["neo4j"]).get(), before + 1);
    }

    #[tokio::test]
    async fn metrics_response_contains_registered_metrics() {
        let cmd = "test_metrics_response";
        record_command_start(cmd);
        record_command_result(cmd, Duration::from_millis(10), true);

        let response = metrics_response().await.expect("metrics response");
        assert_eq!(response.status(), StatusCode::OK);

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect metrics body")
            .to_bytes();
        let text = String::from_utf8(body_bytes.to_vec()).expect("utf-8 metrics body");
        assert!(text.contains("forum_graphrag_command_total"));
        assert!(text.contains(cmd));
    }

    #[test]
    fn init_collectors_can_be_called_multiple_times() {
        init_collectors();
        init_collectors();
        init_collectors();
        // Should not panic
    }

    #[tokio::test]
    async fn metrics_response_has_correct_content_type() {
        let response = metrics_response().await.expect("metrics response");

        let content_type = response.headers().get(hyper::header::CONTENT_TYPE);
        assert!(content_type.is_some());

        let ct_str = content_type.unwrap().to_str().unwrap();
        assert!(ct_str.contains("text/plain") || ct_str.contains("text/"));
    }
}
