// ===============================
// src/config.rs
// ===============================
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
use std::env;
use std::time::Duration;

use dotenvy::dotenv;

/// Which feed dialect the relay delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedVariant {
    /// Push stream: envelope frames on the "trading" channel.
    Stream,
    /// Polled snapshots: `{"key": url, "body": {...}}` page dumps.
    Polled,
}

impl FeedVariant {
    pub fn from_env(key: &str, default_variant: FeedVariant) -> FeedVariant {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "stream" | "push"     => FeedVariant::Stream,
            "polled" | "snapshot" => FeedVariant::Polled,
            _ => default_variant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedVariant::Stream => "stream",
            FeedVariant::Polled => "polled",
        }
    }
}

/// Transport the raw documents arrive over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Stdin,
    Ws,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "stdin" | "pipe"    => FeedMode::Stdin,
            "ws" | "websocket"  => FeedMode::Ws,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Stdin => "stdin",
            FeedMode::Ws    => "ws",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // feed selection
    pub variant: FeedVariant,
    pub mode: FeedMode,
    pub ws_url: String,

    // outbound
    pub forward_url: String,
    pub source_tag: String,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

/// Window durations for the grace/debounce/suppression machinery.
/// All of them are env-tunable in milliseconds.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// Settle window for coalescing TP/SL adjustment bursts.
    pub adjust_debounce: Duration,
    /// How long a snapshot-implied open/reverse waits for its fill.
    pub exec_grace: Duration,
    /// Scheduler tick driving deadline sweeps.
    pub flush_period: Duration,
    /// Fills inside this window of an emitted fill are the same burst.
    pub exec_coalesce: Duration,
    /// How long an orphan polled fill waits for its position row.
    pub polled_exec_grace: Duration,
    /// Quiet window after a close before adjustments may emit again.
    pub suppress_adjust: Duration,
    /// How long a polled fill waits for the order book to catch up.
    pub order_lag: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            adjust_debounce:   Duration::from_millis(750),
            exec_grace:        Duration::from_millis(450),
            flush_period:      Duration::from_millis(100),
            exec_coalesce:     Duration::from_millis(120),
            polled_exec_grace: Duration::from_millis(250),
            suppress_adjust:   Duration::from_millis(500),
            order_lag:         Duration::from_millis(60),
        }
    }
}

impl Tunables {
    /// Named windows, for config gauges and the startup banner.
    pub fn windows(&self) -> [(&'static str, Duration); 7] {
        [
            ("adjust_debounce",   self.adjust_debounce),
            ("exec_grace",        self.exec_grace),
            ("flush_period",      self.flush_period),
            ("exec_coalesce",     self.exec_coalesce),
            ("polled_exec_grace", self.polled_exec_grace),
            ("suppress_adjust",   self.suppress_adjust),
            ("order_lag",         self.order_lag),
        ]
    }
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    let ms = env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

pub fn load() -> (Args, Tunables) {
    // Make sure .env is read (RECORD_FILE, FORWARD_URL, window overrides...)
    let _ = dotenv();

    // ===== Feed =====
    let variant = FeedVariant::from_env("FEED_VARIANT", FeedVariant::Stream);
    let mode    = FeedMode::from_env("FEED_MODE", FeedMode::Stdin);
    let ws_url  = env::var("RELAY_WS_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:9222/relay".to_string());

    // ===== Outbound =====
    let forward_url = env::var("FORWARD_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:5001/forward".to_string());
    let source_tag = env::var("SOURCE_TAG").unwrap_or_else(|_| "COPY_TV".to_string());

    // ===== Files/metrics =====
    let record_file  = env::var("RECORD_FILE").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    let args = Args {
        variant,
        mode,
        ws_url,
        forward_url,
        source_tag,
        record_file,
        metrics_port,
    };

    // ===== Windows =====
    let defaults = Tunables::default();
    let tun = Tunables {
        adjust_debounce:   env_ms("DEBOUNCE_MS",      defaults.adjust_debounce.as_millis() as u64),
        exec_grace:        env_ms("EXEC_GRACE_MS",    defaults.exec_grace.as_millis() as u64),
        flush_period:      env_ms("FLUSH_PERIOD_MS",  defaults.flush_period.as_millis() as u64),
        exec_coalesce:     env_ms("EXEC_COALESCE_MS", defaults.exec_coalesce.as_millis() as u64),
        polled_exec_grace: env_ms("POLLED_GRACE_MS",  defaults.polled_exec_grace.as_millis() as u64),
        suppress_adjust:   env_ms("SUPPRESS_MS",      defaults.suppress_adjust.as_millis() as u64),
        order_lag:         env_ms("ORDER_LAG_MS",     defaults.order_lag.as_millis() as u64),
    };

    (args, tun)
}
