// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static FRAMES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_documents_total", "raw documents from the transport").unwrap());

pub static EVENTS_BY_TYPE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("feed_events_total_by_type", "classified feed events per type"),
        &["type"],
    )
    .unwrap()
});

pub static IGNORED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "feed_documents_ignored_total",
            "documents dropped before the engine (label: reason)",
        ),
        &["reason"],
    )
    .unwrap()
});

// -------- Reconciliation --------
pub static ORDER_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("order_updates_total", "order-channel updates by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static DEDUP_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dedup_dropped_total", "events dropped by duplicate suppression"),
        &["kind"],
    )
    .unwrap()
});

pub static OPEN_CYCLES: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_position_cycles", "position cycles tracked as open").unwrap());

pub static PENDING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("pending_entries", "grace-window entries awaiting resolution (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

// -------- Delivery --------
pub static CALLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("calls_total", "canonical actions produced").unwrap());

pub static CALLS_BY_ACTION: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("calls_total_by_action", "canonical actions produced per action"),
        &["action"],
    )
    .unwrap()
});

pub static CALLS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("calls_dropped_total", "actions dropped on a full delivery queue").unwrap()
});

pub static CALL_DELIVERY: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("call_delivery_total", "delivery attempts by outcome"),
        &["outcome"],
    )
    .unwrap()
});

// Latency from engine emission -> forward ack (milliseconds)
pub static CALL_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("call_delivery_latency_ms", "Delivery latency (ms)")
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
    )
    .unwrap()
});

// -------- Relay socket health --------
pub static FEED_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("feed_ws_connected", "1 if the relay socket is connected, 0 otherwise").unwrap()
});

pub static FEED_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_ws_reconnects_total", "Number of relay socket reconnects").unwrap()
});

// ---- Config visibility (variant / transport / windows) ----
pub static CONFIG_VARIANT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_variant", "feed variant (label: variant)"),
        &["variant"],
    )
    .unwrap()
});

pub static CONFIG_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "transport mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_WINDOW_MS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_window_ms", "engine windows in ms (label: window)"),
        &["window"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(FRAMES.clone())),
        REGISTRY.register(Box::new(EVENTS_BY_TYPE.clone())),
        REGISTRY.register(Box::new(IGNORED.clone())),
        REGISTRY.register(Box::new(ORDER_OUTCOMES.clone())),
        REGISTRY.register(Box::new(DEDUP_DROPS.clone())),
        REGISTRY.register(Box::new(OPEN_CYCLES.clone())),
        REGISTRY.register(Box::new(PENDING.clone())),
        REGISTRY.register(Box::new(CALLS.clone())),
        REGISTRY.register(Box::new(CALLS_BY_ACTION.clone())),
        REGISTRY.register(Box::new(CALLS_DROPPED.clone())),
        REGISTRY.register(Box::new(CALL_DELIVERY.clone())),
        REGISTRY.register(Box::new(CALL_LATENCY_MS.clone())),
        // Relay socket health
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_VARIANT.clone())),
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_WINDOW_MS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
