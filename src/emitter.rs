// ===============================
// src/emitter.rs
// ===============================
//
// Delivers canonical actions to the forwarding endpoint. At most two
// attempts per call with short fixed delays, every outcome logged with the
// exact payload, and a failed delivery never propagates upstream.

use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::Call;
use crate::metrics;

const MAX_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(250);
const ERROR_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct Emitter {
    http: reqwest::Client,
    url: String,
    source: String,
}

impl Emitter {
    pub fn new(url: String, source: String) -> Result<Self, EmitError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { http, url, source })
    }

    /// Startup probe so the first real call does not pay connection setup.
    pub async fn warm_up(&self) {
        match self.http.head(&self.url).send().await {
            Ok(resp) => debug!(status = %resp.status(), "forward endpoint warm-up"),
            Err(e) => warn!(?e, "forward endpoint warm-up failed, continuing"),
        }
    }

    fn wire_body(&self, call: &Call) -> String {
        json!({
            "message": {
                "source": self.source,
                "action": call.action.wire(),
                "ticker": call.ticker,
                "close": call.price,
                "position": call.position,
                "qty": call.exec_qty,
                "tickSize": 0,
                "takeProfit": call.take_profit.unwrap_or(Decimal::ZERO),
                "stopLoss": call.stop_loss.unwrap_or(Decimal::ZERO),
                "infoTP": 0,
                "infoSL": 0,
                "invBol": 0,
                "timestamp": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            }
        })
        .to_string()
    }

    pub async fn deliver(&self, call: &Call) {
        let payload = self.wire_body(call);
        let started = Instant::now();

        for attempt in 1..=MAX_ATTEMPTS {
            let sent = self
                .http
                .post(&self.url)
                .header(CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .send()
                .await;

            match sent {
                Ok(rsp) if rsp.status().is_success() => {
                    info!(status = rsp.status().as_u16(), payload = %payload, "call sent");
                    metrics::CALL_DELIVERY.with_label_values(&["sent"]).inc();
                    metrics::CALL_LATENCY_MS.observe(started.elapsed().as_millis() as f64);
                    return;
                }
                Ok(rsp) => {
                    warn!(
                        status = rsp.status().as_u16(), attempt, max = MAX_ATTEMPTS,
                        payload = %payload,
                        "call failed"
                    );
                    metrics::CALL_DELIVERY.with_label_values(&["failed"]).inc();
                    if attempt == MAX_ATTEMPTS {
                        error!(payload = %payload, "call given up");
                        metrics::CALL_DELIVERY.with_label_values(&["gave_up"]).inc();
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(?e, attempt, max = MAX_ATTEMPTS, payload = %payload, "call transport error");
                    metrics::CALL_DELIVERY.with_label_values(&["error"]).inc();
                    if attempt == MAX_ATTEMPTS {
                        error!(payload = %payload, "call given up (transport)");
                        metrics::CALL_DELIVERY.with_label_values(&["gave_up"]).inc();
                    }
                    tokio::time::sleep(ERROR_DELAY).await;
                }
            }
        }
    }
}

/// Serial consumer: calls leave in the order the engine produced them.
pub async fn run(mut rx: mpsc::Receiver<Call>, emitter: Emitter) {
    info!("call emitter started");
    while let Some(call) = rx.recv().await {
        emitter.deliver(&call).await;
    }
    info!("call emitter stopped, queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionCode;
    use rust_decimal_macros::dec;
    use serde_json::Value;

    fn emitter() -> Emitter {
        Emitter::new("http://127.0.0.1:5001/".to_string(), "COPY_TV".to_string()).unwrap()
    }

    #[test]
    fn test_wire_body_carries_the_contract_fields() {
        let call = Call {
            action: ActionCode::OpenLong,
            ticker: "EURUSD".to_string(),
            price: dec!(100.5),
            position: dec!(5),
            exec_qty: dec!(5),
            take_profit: Some(dec!(110)),
            stop_loss: None,
        };
        let v: Value = serde_json::from_str(&emitter().wire_body(&call)).unwrap();
        let m = &v["message"];
        assert_eq!(m["source"], "COPY_TV");
        assert_eq!(m["action"], 1);
        assert_eq!(m["ticker"], "EURUSD");
        assert!(m["close"].is_number());
        assert!(m["position"].is_number());
        // absent levels flatten to zero on the wire
        assert_eq!(m["takeProfit"], json!(110.0));
        assert_eq!(m["stopLoss"], json!(0.0));
        assert_eq!(m["tickSize"], 0);
        assert_eq!(m["infoTP"], 0);
        assert_eq!(m["infoSL"], 0);
        assert_eq!(m["invBol"], 0);
    }

    #[test]
    fn test_wire_timestamp_is_utc_millis() {
        let call = Call {
            action: ActionCode::Close,
            ticker: "EURUSD".to_string(),
            price: dec!(0),
            position: dec!(0),
            exec_qty: dec!(5),
            take_profit: None,
            stop_loss: None,
        };
        let v: Value = serde_json::from_str(&emitter().wire_body(&call)).unwrap();
        let ts = v["message"]["timestamp"].as_str().unwrap();
        // 2025-01-02T03:04:05.678Z
        assert_eq!(ts.len(), 24);
        assert!(ts.ends_with('Z'));
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
        assert_eq!(v["message"]["action"], 0);
    }
}
