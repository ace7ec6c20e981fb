// ===============================
// src/engine_polled.rs
// ===============================
//
// Snapshot-diff engine for the polled feed. Position rows, working-order
// books and execution lists are whole re-polled views; deltas against the
// last combined state decide what to emit. TP/SL are implied by the order
// book (see infer); suppression and close-guard windows keep the order-book
// churn around a close from leaking out as adjustments.

use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Tunables;
use crate::dedup::ExecSeen;
use crate::domain::{
    fmt_opt, ActionCode, Call, Event, FeedEvent, PolledExecution, PolledPosition, WorkingOrder,
};
use crate::engine::forward_calls;
use crate::infer::protective_levels;
use crate::metrics;

/// Last reconciled view of one instrument: position plus implied levels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CombinedState {
    signed_qty: Decimal,
    avg: Decimal,
    tp: Option<Decimal>,
    sl: Option<Decimal>,
}

/// Fills for an instrument the position snapshot has not shown yet.
struct PolledAgg {
    qty_abs: Decimal,
    last_price: Decimal,
    last_action: ActionCode,
    deadline: Instant,
}

/// Fill held back briefly because the order book may lag it; levels are
/// inferred when the deadline passes.
struct DeferredFill {
    action: ActionCode,
    instrument: String,
    avg: Decimal,
    position: Decimal,
    qty_abs: Decimal,
    deadline: Instant,
}

pub struct PolledEngine {
    tun: Tunables,
    positions: AHashMap<String, (Decimal, Decimal)>,
    working: AHashMap<String, Vec<WorkingOrder>>,
    combined: AHashMap<String, CombinedState>,
    suppress_until: AHashMap<String, Instant>,
    closing_until: AHashMap<String, Instant>,
    exec_seen: ExecSeen,
    early: AHashMap<String, PolledAgg>,
    deferred: Vec<DeferredFill>,
}

impl PolledEngine {
    pub fn new(tun: Tunables, start_epoch_sec: i64) -> Self {
        Self {
            tun,
            positions: AHashMap::new(),
            working: AHashMap::new(),
            combined: AHashMap::new(),
            suppress_until: AHashMap::new(),
            closing_until: AHashMap::new(),
            exec_seen: ExecSeen::new(start_epoch_sec),
            early: AHashMap::new(),
            deferred: Vec::new(),
        }
    }

    /// Positions page: upsert every non-zero row, then close out every stored
    /// instrument the page no longer shows. A zero-quantity row counts as
    /// absent.
    pub fn on_positions(&mut self, rows: &[PolledPosition], now: Instant) -> Vec<Call> {
        let mut out = Vec::new();
        let mut seen_now: AHashSet<&str> = AHashSet::new();

        for row in rows {
            if row.signed_qty.is_zero() {
                continue;
            }
            seen_now.insert(row.instrument.as_str());
            self.positions.insert(row.instrument.clone(), (row.signed_qty, row.avg_price));
            out.extend(self.recompute(&row.instrument, now));
        }

        let closed: Vec<(String, Decimal)> = self
            .positions
            .iter()
            .filter(|(instr, v)| !seen_now.contains(instr.as_str()) && !v.0.is_zero())
            .map(|(instr, v)| (instr.clone(), v.0))
            .collect();

        for (instr, prev_qty) in closed {
            self.positions.remove(&instr);
            self.combined.remove(&instr);
            self.working.remove(&instr);
            self.early.remove(&instr);
            self.suppress_until.insert(instr.clone(), now + self.tun.suppress_adjust);
            self.closing_until.insert(instr.clone(), now + self.tun.suppress_adjust);
            info!(instrument = %instr, qty = %prev_qty.abs(), "position closed (left the snapshot)");
            out.push(Call {
                action: ActionCode::Close,
                ticker: instr,
                price: Decimal::ZERO,
                position: Decimal::ZERO,
                exec_qty: prev_qty.abs(),
                take_profit: None,
                stop_loss: None,
            });
        }
        self.update_gauges();
        out
    }

    /// Orders page: replace the whole book, recompute every open instrument,
    /// then arm the guards for instruments whose working orders vanished
    /// while the position is still open.
    pub fn on_orders(&mut self, rows: Vec<(String, WorkingOrder)>, now: Instant) -> Vec<Call> {
        let mut book: AHashMap<String, Vec<WorkingOrder>> = AHashMap::new();
        for (instr, order) in rows {
            book.entry(instr).or_default().push(order);
        }
        let prev = std::mem::replace(&mut self.working, book);

        let mut out = Vec::new();
        let instruments: Vec<String> = self.positions.keys().cloned().collect();
        for instr in instruments {
            out.extend(self.recompute(&instr, now));
        }

        for (instr, prev_orders) in prev {
            let had = !prev_orders.is_empty();
            let has_now = self.working.get(&instr).map_or(false, |l| !l.is_empty());
            let open = self.positions.get(&instr).map_or(false, |v| !v.0.is_zero());
            if had && !has_now && open {
                let expired = self.suppress_until.get(&instr).map_or(true, |until| now >= *until);
                if expired {
                    self.suppress_until.insert(instr.clone(), now + self.tun.suppress_adjust);
                }
                self.closing_until.insert(instr.clone(), now + self.tun.suppress_adjust);
                debug!(instrument = %instr, "order book emptied under an open position, guards armed");
            }
        }
        self.update_gauges();
        out
    }

    /// Executions page: the endpoint re-sends history, so ids are deduped for
    /// the process lifetime and each instrument's first batch primes the seen
    /// set with everything stamped before startup.
    pub fn on_executions(&mut self, rows: &[PolledExecution], now: Instant) -> Vec<Call> {
        let mut out = Vec::new();
        let mut batch: Vec<&PolledExecution> = rows.iter().collect();

        if let Some(primary) = rows
            .iter()
            .map(|r| r.instrument.as_str())
            .find(|i| !i.trim().is_empty())
        {
            if self.exec_seen.needs_priming(primary) {
                let mut keep = Vec::with_capacity(batch.len());
                for r in batch {
                    if self.exec_seen.predates_start(r.time_sec) {
                        self.exec_seen.record(&r.id);
                    } else {
                        keep.push(r);
                    }
                }
                debug!(instrument = %primary, total = rows.len(), "primed execution history");
                batch = keep;
            }
        }

        for r in batch {
            if self.exec_seen.predates_start(r.time_sec) {
                self.exec_seen.record(&r.id);
                continue;
            }
            if !self.exec_seen.record(&r.id) {
                metrics::DEDUP_DROPS.with_label_values(&["execution"]).inc();
                continue;
            }
            if r.instrument.trim().is_empty() {
                continue;
            }
            let action = ActionCode::fill(r.side);

            let open = self.positions.get(&r.instrument).copied().filter(|v| !v.0.is_zero());
            if let Some((signed, avg)) = open {
                let avg = if avg.is_zero() { r.price } else { avg };
                let has_orders = self.working.get(&r.instrument).map_or(false, |l| !l.is_empty());
                if has_orders {
                    let (tp, sl) = self.infer_levels(&r.instrument, signed, avg);
                    out.push(Call {
                        action,
                        ticker: r.instrument.clone(),
                        price: avg,
                        position: signed,
                        exec_qty: r.qty.abs(),
                        take_profit: tp,
                        stop_loss: sl,
                    });
                } else {
                    debug!(instrument = %r.instrument, "order book lags the fill, deferring");
                    self.deferred.push(DeferredFill {
                        action,
                        instrument: r.instrument.clone(),
                        avg,
                        position: signed,
                        qty_abs: r.qty.abs(),
                        deadline: now + self.tun.order_lag,
                    });
                }
                self.early.remove(&r.instrument);
                continue;
            }

            let agg = self.early.entry(r.instrument.clone()).or_insert_with(|| PolledAgg {
                qty_abs: Decimal::ZERO,
                last_price: Decimal::ZERO,
                last_action: action,
                deadline: now + self.tun.polled_exec_grace,
            });
            agg.qty_abs += r.qty.abs();
            agg.last_price = r.price;
            agg.last_action = action;
            debug!(instrument = %r.instrument, total = %agg.qty_abs, "fill aggregated, no open position yet");
        }
        self.update_gauges();
        out
    }

    /// Deadline sweep for deferred fills and positionless aggregates.
    pub fn tick(&mut self, now: Instant) -> Vec<Call> {
        let mut out = Vec::new();

        let mut still = Vec::new();
        for df in std::mem::take(&mut self.deferred) {
            if now >= df.deadline {
                let (tp, sl) = self.infer_levels(&df.instrument, df.position, df.avg);
                out.push(Call {
                    action: df.action,
                    ticker: df.instrument,
                    price: df.avg,
                    position: df.position,
                    exec_qty: df.qty_abs,
                    take_profit: tp,
                    stop_loss: sl,
                });
            } else {
                still.push(df);
            }
        }
        self.deferred = still;

        let due: Vec<String> = self
            .early
            .iter()
            .filter(|(_, a)| now >= a.deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for instr in due {
            let Some(agg) = self.early.remove(&instr) else { continue };
            let open = self.positions.get(&instr).copied().filter(|v| !v.0.is_zero());
            if let Some((signed, avg)) = open {
                let price = if avg.is_zero() { agg.last_price } else { avg };
                let (tp, sl) = self.infer_levels(&instr, signed, price);
                out.push(Call {
                    action: agg.last_action,
                    ticker: instr,
                    price,
                    position: signed,
                    exec_qty: agg.qty_abs,
                    take_profit: tp,
                    stop_loss: sl,
                });
            } else {
                debug!(instrument = %instr, qty = %agg.qty_abs, "aggregated fills discarded, position never appeared");
            }
        }

        self.update_gauges();
        out
    }

    fn infer_levels(&self, instr: &str, signed: Decimal, avg: Decimal) -> (Option<Decimal>, Option<Decimal>) {
        let orders = self.working.get(instr).map(Vec::as_slice).unwrap_or(&[]);
        protective_levels(signed, avg, orders)
    }

    /// Re-derives the combined state for one instrument and emits whatever
    /// changed: first sight opens ungated, position deltas ungated, level
    /// deltas gated behind the suppress and close-guard windows.
    fn recompute(&mut self, instr: &str, now: Instant) -> Vec<Call> {
        let Some((signed, avg)) = self.positions.get(instr).copied() else {
            return Vec::new();
        };
        let old = self.combined.get(instr).copied();
        let (tp, sl) = self.infer_levels(instr, signed, avg);
        let combined = CombinedState { signed_qty: signed, avg, tp, sl };

        let tp_changed = old.map_or(false, |o| o.tp != combined.tp);
        let sl_changed = old.map_or(false, |o| o.sl != combined.sl);
        let position_changed = old.map_or(false, |o| o.signed_qty != combined.signed_qty);

        self.combined.insert(instr.to_string(), combined);
        let closing_now = self.closing_until.get(instr).map_or(false, |u| now < *u);

        let mut out = Vec::new();

        if old.is_none() && !combined.signed_qty.is_zero() {
            out.push(Call {
                action: if combined.signed_qty > Decimal::ZERO {
                    ActionCode::OpenLong
                } else {
                    ActionCode::OpenShort
                },
                ticker: instr.to_string(),
                price: combined.avg,
                position: combined.signed_qty,
                exec_qty: combined.signed_qty.abs(),
                take_profit: combined.tp,
                stop_loss: combined.sl,
            });
        }

        let levels_lost = !combined.signed_qty.is_zero()
            && combined.tp.is_none()
            && combined.sl.is_none()
            && old.map_or(false, |o| o.tp.is_some() || o.sl.is_some());
        if levels_lost {
            self.suppress_until.insert(instr.to_string(), now + self.tun.suppress_adjust);
            self.closing_until.insert(instr.to_string(), now + self.tun.suppress_adjust);
            debug!(instrument = %instr, "protective levels vanished while open, guards armed");
        }
        if !combined.signed_qty.is_zero() && (combined.tp.is_some() || combined.sl.is_some()) {
            self.closing_until.remove(instr);
        }

        let suppress_now = self.suppress_until.get(instr).map_or(false, |u| now < *u);

        if position_changed && !combined.signed_qty.is_zero() {
            let delta = (combined.signed_qty - old.map(|o| o.signed_qty).unwrap_or_default()).abs();
            if delta > Decimal::ZERO {
                out.push(Call {
                    action: if combined.signed_qty > Decimal::ZERO {
                        ActionCode::OpenLong
                    } else {
                        ActionCode::OpenShort
                    },
                    ticker: instr.to_string(),
                    price: combined.avg,
                    position: combined.signed_qty,
                    exec_qty: delta,
                    take_profit: combined.tp,
                    stop_loss: combined.sl,
                });
            }
        }

        if !suppress_now && !closing_now && tp_changed {
            out.push(Call {
                action: ActionCode::TakeProfitChange,
                ticker: instr.to_string(),
                price: combined.avg,
                position: combined.signed_qty,
                exec_qty: Decimal::ZERO,
                take_profit: combined.tp,
                stop_loss: combined.sl,
            });
        }
        if !suppress_now && !closing_now && sl_changed {
            let action = if combined.sl.map_or(false, |v| v == combined.avg) {
                ActionCode::BreakEvenStop
            } else {
                ActionCode::StopLossChange
            };
            out.push(Call {
                action,
                ticker: instr.to_string(),
                price: combined.avg,
                position: combined.signed_qty,
                exec_qty: Decimal::ZERO,
                take_profit: combined.tp,
                stop_loss: combined.sl,
            });
        }

        info!(
            instrument = %instr, pos = %signed, avg = %avg,
            tp = %fmt_opt(combined.tp), sl = %fmt_opt(combined.sl),
            "combined state"
        );
        out
    }

    fn update_gauges(&self) {
        metrics::OPEN_CYCLES.set(self.positions.len() as i64);
        metrics::PENDING.with_label_values(&["early_fill"]).set(self.early.len() as i64);
        metrics::PENDING.with_label_values(&["deferred_fill"]).set(self.deferred.len() as i64);
    }
}

pub async fn run(
    mut rx: mpsc::Receiver<FeedEvent>,
    call_tx: mpsc::Sender<Call>,
    rec_tx: mpsc::Sender<Event>,
    tun: Tunables,
) {
    let start_epoch = chrono::Utc::now().timestamp();
    let mut eng = PolledEngine::new(tun.clone(), start_epoch);
    let mut tick = tokio::time::interval(tun.flush_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(start_epoch, "polled engine started");

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => {
                    let calls = dispatch(&mut eng, ev);
                    forward_calls(calls, &call_tx, &rec_tx);
                }
                None => {
                    info!("polled engine stopped, feed channel closed");
                    break;
                }
            },
            _ = tick.tick() => {
                let calls = eng.tick(Instant::now());
                forward_calls(calls, &call_tx, &rec_tx);
            }
        }
    }
}

fn dispatch(eng: &mut PolledEngine, ev: FeedEvent) -> Vec<Call> {
    let now = Instant::now();
    match ev {
        FeedEvent::PolledPositions(rows) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["positions_page"]).inc();
            eng.on_positions(&rows, now)
        }
        FeedEvent::PolledOrders(rows) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["orders_page"]).inc();
            eng.on_orders(rows, now)
        }
        FeedEvent::PolledExecutions(rows) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["executions_page"]).inc();
            eng.on_executions(&rows, now)
        }
        FeedEvent::Disconnected => {
            warn!("feed disconnected, polled state kept as-is");
            Vec::new()
        }
        // stream events never reach this engine
        _ => Vec::new(),
    }
}
