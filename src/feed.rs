// ===============================
// src/feed.rs
// ===============================
//
// Transport adapters. Both only move raw documents into the engine queue:
//   run_stdin : newline-delimited JSON documents (replay files, pipes)
//   run_ws    : relay WebSocket forwarding the upstream session's frames
//
// Classification happens here so the queue carries typed events and the
// engine task never touches raw JSON.

use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::classify::{self, Classified};
use crate::config::FeedVariant;
use crate::domain::FeedEvent;
use crate::metrics;

async fn classify_and_queue(variant: FeedVariant, raw: &str, tx: &mpsc::Sender<FeedEvent>) {
    metrics::FRAMES.inc();
    let classified = match variant {
        FeedVariant::Stream => classify::stream_line(raw),
        FeedVariant::Polled => classify::polled_line(raw),
    };
    match classified {
        Ok(Classified::Event(ev)) => {
            // backpressure lands here, on the transport, never on the engine
            let _ = tx.send(ev).await;
        }
        Ok(Classified::Ignored(reason)) => {
            metrics::IGNORED.with_label_values(&[reason]).inc();
        }
        Err(e) => {
            metrics::IGNORED.with_label_values(&["malformed"]).inc();
            warn!(?e, "dropping malformed document");
        }
    }
}

pub async fn run_stdin(variant: FeedVariant, tx: mpsc::Sender<FeedEvent>) {
    info!("reading documents from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                classify_and_queue(variant, line, &tx).await;
            }
            Ok(None) => {
                info!("stdin closed, feed finished");
                let _ = tx.send(FeedEvent::Disconnected).await;
                break;
            }
            Err(e) => {
                error!(?e, "stdin read error");
                let _ = tx.send(FeedEvent::Disconnected).await;
                break;
            }
        }
    }
}

pub async fn run_ws(variant: FeedVariant, ws_url: String, tx: mpsc::Sender<FeedEvent>) {
    let mut attempt: u32 = 0;
    loop {
        let url = match Url::parse(&ws_url) {
            Ok(u) => u,
            Err(e) => {
                error!(?e, %ws_url, "bad ws url");
                return;
            }
        };

        info!(%ws_url, "connecting relay feed");
        match connect_async(url.as_str()).await {
            Ok((mut ws, _resp)) => {
                info!("relay feed connected");
                metrics::FEED_CONNECTED.set(1);
                attempt = 0;

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(m) if m.is_text() => {
                            let txt = match m.into_text() {
                                Ok(t) => t,
                                Err(e) => {
                                    warn!(?e, "failed to read text frame");
                                    continue;
                                }
                            };
                            classify_and_queue(variant, &txt, &tx).await;
                        }
                        Ok(_) => {
                            // binary, ping and pong frames carry nothing for us
                        }
                        Err(e) => {
                            error!(?e, "ws read error");
                            break;
                        }
                    }
                }

                metrics::FEED_CONNECTED.set(0);
                metrics::FEED_RECONNECTS.inc();
                warn!("relay feed disconnected, will reconnect");
                let _ = tx.send(FeedEvent::Disconnected).await;
            }
            Err(e) => {
                metrics::FEED_CONNECTED.set(0);
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);
        let base_ms = 500u64.saturating_mul(1u64 << shift);
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}
