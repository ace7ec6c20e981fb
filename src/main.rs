// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/copyrelay_rust

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(feed_variant|feed_mode|window_ms)'

# aktivitas ingest & delivery
curl -s localhost:9898/metrics | grep '^feed_documents_total'
curl -s localhost:9898/metrics | egrep '^(calls_total|call_delivery_total)'

*/
/*
=============================================================================
Project : copyrelay_rust — trading-event normalization & forwarding engine
Module  : <module_name>.rs
Version : 0.4.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Ingests noisy broker events (position snapshots, fills, working
          orders) from a relay feed or stdin, reconciles them into clean
          per-account position lifecycles, and forwards canonical trade
          actions to an HTTP endpoint. Exposes Prometheus metrics and
          records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod extract;
mod classify;
mod dedup;
mod infer;
mod engine;         // push-stream lifecycle engine
mod engine_polled;  // snapshot-diff engine for polled pages
mod emitter;

use tokio::{sync::mpsc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::domain::{Call, Event, FeedEvent};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ---- Load config & windows ----
    let (args, tun) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Human-friendly startup info + export config to metrics ----
    info!(
        variant = %args.variant.as_str(),
        mode = %args.mode.as_str(),
        ws_url = %args.ws_url,
        forward_url = %args.forward_url,
        source = %args.source_tag,
        "startup config"
    );

    crate::metrics::CONFIG_VARIANT
        .with_label_values(&[args.variant.as_str()])
        .set(1);
    crate::metrics::CONFIG_MODE
        .with_label_values(&[args.mode.as_str()])
        .set(1);
    for (window, dur) in tun.windows() {
        crate::metrics::CONFIG_WINDOW_MS
            .with_label_values(&[window])
            .set(dur.as_millis() as i64);
    }

    // ---- Buses ----
    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(2048);
    let (call_tx, call_rx) = mpsc::channel::<Call>(512);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
    }

    // ---- Call emitter ----
    let em = match emitter::Emitter::new(args.forward_url.clone(), args.source_tag.clone()) {
        Ok(em) => em,
        Err(e) => {
            error!(?e, "emitter init failed");
            return;
        }
    };
    {
        let warm = em.clone();
        tokio::spawn(async move { warm.warm_up().await });
    }
    tokio::spawn(emitter::run(call_rx, em));

    // ---- Engine (one per process, picked by feed variant) ----
    match args.variant {
        config::FeedVariant::Stream => {
            tokio::spawn(engine::run(feed_rx, call_tx, rec_tx.clone(), tun));
        }
        config::FeedVariant::Polled => {
            tokio::spawn(engine_polled::run(feed_rx, call_tx, rec_tx.clone(), tun));
        }
    }

    // ---- FEED (raw documents) ----
    match args.mode {
        config::FeedMode::Stdin => {
            tokio::spawn(feed::run_stdin(args.variant, feed_tx));
        }
        config::FeedMode::Ws => {
            tokio::spawn(feed::run_ws(args.variant, args.ws_url.clone(), feed_tx));
        }
    }

    // ---- Heartbeat ----
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        info!(
            documents = metrics::FRAMES.get(),
            calls = metrics::CALLS.get(),
            "heartbeat"
        );
    }
}
