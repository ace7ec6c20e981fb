// ===============================
// src/engine.rs
// ===============================
//
// Push-stream reconciliation engine. One instance owns every per-key map for
// its feed and the run loop is the only writer, so transitions are serialized
// without locks. Entry points take `now` so window logic stays deterministic
// under test; wall-clock only enters through the run loop.

use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Tunables;
use crate::dedup::{self, OrderSeen};
use crate::domain::{
    fmt_opt, ActionCode, Call, Event, ExecutionEvent, FeedEvent, OrderUpdate, PositionKey,
    PositionSnapshot, Side,
};
use crate::metrics;

/// One open position cycle plus the adjustment burst accumulated since the
/// last flush.
struct PositionCycle {
    opened_at: Instant,
    dir: Side,
    qty: Decimal,
    open_price: Decimal,
    last_avg: Decimal,
    sl_start: Option<Decimal>,
    sl_end: Option<Decimal>,
    tp_start: Option<Decimal>,
    tp_end: Option<Decimal>,
    sl_changed: bool,
    tp_changed: bool,
    tp_cancelled: bool,
    tp_set_later: bool,
    pending_infos: Vec<String>,
    pending_since: Option<Instant>,
    pending_sl_changed: bool,
    pending_tp_changed: bool,
}

impl PositionCycle {
    fn new(now: Instant, dir: Side, snap: &PositionSnapshot) -> Self {
        Self {
            opened_at: now,
            dir,
            qty: snap.qty,
            open_price: snap.avg_price,
            last_avg: snap.avg_price,
            sl_start: snap.stop_loss,
            sl_end: snap.stop_loss,
            tp_start: snap.take_profit,
            tp_end: snap.take_profit,
            sl_changed: false,
            tp_changed: false,
            tp_cancelled: false,
            tp_set_later: false,
            pending_infos: Vec::new(),
            pending_since: None,
            pending_sl_changed: false,
            pending_tp_changed: false,
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending_infos.is_empty() || self.pending_sl_changed || self.pending_tp_changed
    }

    /// Notes for the close log: the un-flushed burst if one exists, otherwise
    /// a summary of what changed over the whole cycle.
    fn close_notes(&self) -> String {
        let mut notes: Vec<String> = Vec::new();
        if !self.pending_infos.is_empty() {
            notes.extend(self.pending_infos.iter().cloned());
        } else {
            if self.sl_changed {
                notes.push(format!("SL {} -> {}", fmt_opt(self.sl_start), fmt_opt(self.sl_end)));
            }
            if self.tp_cancelled {
                notes.push("TP cancelled".to_string());
            } else if self.tp_set_later {
                notes.push(format!("TP set {}", fmt_opt(self.tp_end)));
            } else if self.tp_changed {
                notes.push(format!("TP {} -> {}", fmt_opt(self.tp_start), fmt_opt(self.tp_end)));
            }
        }
        dedup_in_order(&mut notes);
        notes.join("; ")
    }
}

/// Snapshot-implied open or reverse waiting out its grace window.
struct PendingAction {
    action: ActionCode,
    symbol: String,
    avg: Decimal,
    position: Decimal,
    tp: Option<Decimal>,
    sl: Option<Decimal>,
    created_at: Instant,
    deadline: Instant,
}

/// Fills that arrived before any snapshot showed the position.
struct EarlyAgg {
    qty_abs: Decimal,
    last_price: Decimal,
    last_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OrderKey {
    id: i64,
    kind: String,
}

struct OrderState {
    price: Decimal,
    status: String,
    tp: Option<Decimal>,
    sl: Option<Decimal>,
}

/// What an order update amounted to after dedup and change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    New,
    Updated,
    Unchanged,
    Duplicate,
    IgnoredPending,
    IgnoredOco,
}

impl OrderOutcome {
    pub fn label(self) -> &'static str {
        match self {
            OrderOutcome::New => "new",
            OrderOutcome::Updated => "updated",
            OrderOutcome::Unchanged => "unchanged",
            OrderOutcome::Duplicate => "duplicate",
            OrderOutcome::IgnoredPending => "pending",
            OrderOutcome::IgnoredOco => "oco",
        }
    }
}

pub struct StreamEngine {
    tun: Tunables,
    cycles: AHashMap<PositionKey, PositionCycle>,
    pending_opens: AHashMap<PositionKey, PendingAction>,
    pending_reverses: AHashMap<PositionKey, PendingAction>,
    early_exec: AHashMap<PositionKey, EarlyAgg>,
    last_fill_emit: AHashMap<PositionKey, Instant>,
    order_seen: OrderSeen,
    order_states: AHashMap<OrderKey, OrderState>,
}

impl StreamEngine {
    pub fn new(tun: Tunables) -> Self {
        Self {
            tun,
            cycles: AHashMap::new(),
            pending_opens: AHashMap::new(),
            pending_reverses: AHashMap::new(),
            early_exec: AHashMap::new(),
            last_fill_emit: AHashMap::new(),
            order_seen: OrderSeen::default(),
            order_states: AHashMap::new(),
        }
    }

    pub fn on_position(&mut self, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let key = PositionKey { account: snap.account, symbol: snap.symbol.clone() };
        let flat_now = snap.qty.is_zero();
        let had_open = self.cycles.contains_key(&key);

        let out = match (had_open, flat_now) {
            (false, false) => self.open_cycle(key, snap, now),
            (false, true) => self.flat_noise(key, snap, now),
            (true, false) => self.adjust_or_reverse(key, snap, now),
            (true, true) => self.end_cycle(key, snap, now),
        };
        self.update_gauges();
        out
    }

    fn open_cycle(&mut self, key: PositionKey, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let dir = if snap.qty > Decimal::ZERO { Side::Buy } else { Side::Sell };
        info!(
            symbol = %snap.symbol, dir = ?dir, qty = %snap.qty.abs(), avg = %snap.avg_price,
            sl = %fmt_opt(snap.stop_loss), tp = %fmt_opt(snap.take_profit),
            "position opened"
        );
        self.cycles.insert(key.clone(), PositionCycle::new(now, dir, snap));

        // A fill burst that beat this snapshot becomes the open emission,
        // and no grace-window entry is parked at all.
        if let Some(agg) = self.take_fresh_agg(&key, now) {
            let price = if snap.avg_price.is_zero() { agg.last_price } else { snap.avg_price };
            info!(symbol = %snap.symbol, qty = %agg.qty_abs, "open consolidated with early fills");
            self.last_fill_emit.insert(key, now);
            return vec![Call {
                action: ActionCode::fill(dir),
                ticker: snap.symbol.clone(),
                price,
                position: snap.qty,
                exec_qty: agg.qty_abs,
                take_profit: snap.take_profit,
                stop_loss: snap.stop_loss,
            }];
        }

        self.early_exec.remove(&key);
        self.pending_opens.insert(key, PendingAction {
            action: ActionCode::fill(dir),
            symbol: snap.symbol.clone(),
            avg: snap.avg_price,
            position: snap.qty,
            tp: snap.take_profit,
            sl: snap.stop_loss,
            created_at: now,
            deadline: now + self.tun.exec_grace,
        });
        Vec::new()
    }

    fn flat_noise(&mut self, key: PositionKey, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let mut out = Vec::new();
        if let Some(agg) = self.take_fresh_agg(&key, now) {
            // a round trip completed before any snapshot showed it open
            warn!(
                symbol = %snap.symbol, qty = %agg.qty_abs,
                "flat snapshot with recent fills, consolidating as a close"
            );
            out.push(Call {
                action: ActionCode::Close,
                ticker: snap.symbol.clone(),
                price: agg.last_price,
                position: Decimal::ZERO,
                exec_qty: agg.qty_abs,
                take_profit: None,
                stop_loss: None,
            });
        } else {
            debug!(symbol = %snap.symbol, "flat snapshot for a flat key, nothing to do");
        }
        self.pending_opens.remove(&key);
        self.pending_reverses.remove(&key);
        out
    }

    fn adjust_or_reverse(&mut self, key: PositionKey, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let flipped = self
            .cycles
            .get(&key)
            .map_or(false, |st| (snap.qty > Decimal::ZERO) != (st.qty > Decimal::ZERO));
        if flipped {
            return self.reverse_cycle(key, snap, now);
        }

        let Some(st) = self.cycles.get_mut(&key) else { return Vec::new() };
        let mut any_change = false;

        if snap.qty != st.qty {
            st.pending_infos.push(format!("QTY {} -> {}", st.qty.abs(), snap.qty.abs()));
            any_change = true;
        }
        if snap.avg_price != st.last_avg {
            st.pending_infos.push(format!("AVG {} -> {}", st.last_avg, snap.avg_price));
            st.last_avg = snap.avg_price;
            any_change = true;
        }
        if st.sl_end != snap.stop_loss {
            st.pending_infos.push(format!("SL {} -> {}", fmt_opt(st.sl_end), fmt_opt(snap.stop_loss)));
            st.sl_changed = true;
            st.sl_end = snap.stop_loss;
            st.pending_sl_changed = true;
            any_change = true;
        }
        if st.tp_end != snap.take_profit {
            match (st.tp_end, snap.take_profit) {
                (Some(_), None) => {
                    st.tp_cancelled = true;
                    st.pending_infos.push("TP cancelled".to_string());
                }
                (None, Some(tp)) => {
                    st.tp_set_later = true;
                    st.pending_infos.push(format!("TP set {tp}"));
                }
                _ => {
                    st.tp_changed = true;
                    st.pending_infos.push(format!(
                        "TP {} -> {}",
                        fmt_opt(st.tp_end),
                        fmt_opt(snap.take_profit)
                    ));
                }
            }
            st.tp_end = snap.take_profit;
            st.pending_tp_changed = true;
            any_change = true;
        }

        if any_change && st.pending_since.is_none() {
            st.pending_since = Some(now);
        }
        st.qty = snap.qty;
        Vec::new()
    }

    fn reverse_cycle(&mut self, key: PositionKey, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let mut out = Vec::new();
        if let Some(old) = self.cycles.remove(&key) {
            info!(
                symbol = %snap.symbol, dir = ?old.dir, qty = %old.qty.abs(), open = %old.open_price,
                held = ?now.duration_since(old.opened_at), notes = %old.close_notes(),
                "position closed"
            );
            out.push(Call {
                action: ActionCode::Close,
                ticker: snap.symbol.clone(),
                price: Decimal::ZERO,
                position: Decimal::ZERO,
                exec_qty: old.qty.abs(),
                take_profit: None,
                stop_loss: None,
            });
        }

        let dir = if snap.qty > Decimal::ZERO { Side::Buy } else { Side::Sell };
        info!(
            symbol = %snap.symbol, dir = ?dir, qty = %snap.qty.abs(), avg = %snap.avg_price,
            sl = %fmt_opt(snap.stop_loss), tp = %fmt_opt(snap.take_profit),
            "position opened on reversal"
        );
        self.cycles.insert(key.clone(), PositionCycle::new(now, dir, snap));
        self.pending_opens.remove(&key);

        if let Some(agg) = self.take_fresh_agg(&key, now) {
            let price = if snap.avg_price.is_zero() { agg.last_price } else { snap.avg_price };
            info!(symbol = %snap.symbol, qty = %agg.qty_abs, "reversal consolidated with early fills");
            self.last_fill_emit.insert(key, now);
            out.push(Call {
                action: ActionCode::reverse(dir),
                ticker: snap.symbol.clone(),
                price,
                position: snap.qty,
                exec_qty: agg.qty_abs,
                take_profit: snap.take_profit,
                stop_loss: snap.stop_loss,
            });
            return out;
        }

        self.early_exec.remove(&key);
        self.pending_reverses.insert(key, PendingAction {
            action: ActionCode::reverse(dir),
            symbol: snap.symbol.clone(),
            avg: snap.avg_price,
            position: snap.qty,
            tp: snap.take_profit,
            sl: snap.stop_loss,
            created_at: now,
            deadline: now + self.tun.exec_grace,
        });
        out
    }

    fn end_cycle(&mut self, key: PositionKey, snap: &PositionSnapshot, now: Instant) -> Vec<Call> {
        let Some(st) = self.cycles.remove(&key) else { return Vec::new() };
        info!(
            symbol = %snap.symbol, dir = ?st.dir, qty = %st.qty.abs(), open = %st.open_price,
            held = ?now.duration_since(st.opened_at), notes = %st.close_notes(),
            "position closed"
        );
        self.last_fill_emit.remove(&key);
        self.pending_opens.remove(&key);
        self.pending_reverses.remove(&key);
        vec![Call {
            action: ActionCode::Close,
            ticker: snap.symbol.clone(),
            price: Decimal::ZERO,
            position: Decimal::ZERO,
            exec_qty: st.qty.abs(),
            take_profit: None,
            stop_loss: None,
        }]
    }

    pub fn on_execution(&mut self, exec: &ExecutionEvent, now: Instant) -> Vec<Call> {
        let key = PositionKey { account: exec.account, symbol: exec.symbol.clone() };

        let out = if let Some(st) = self.cycles.get(&key) {
            if self
                .last_fill_emit
                .get(&key)
                .map_or(false, |last| now.duration_since(*last) < self.tun.exec_coalesce)
            {
                debug!(symbol = %exec.symbol, "fill coalesced into the previous emission");
                return Vec::new();
            }
            let call = Call {
                action: ActionCode::fill(exec.side),
                ticker: exec.symbol.clone(),
                price: st.last_avg,
                position: st.qty,
                exec_qty: exec.qty.abs(),
                take_profit: st.tp_end,
                stop_loss: st.sl_end,
            };
            self.last_fill_emit.insert(key.clone(), now);
            vec![call]
        } else {
            let agg = self.early_exec.entry(key.clone()).or_insert_with(|| EarlyAgg {
                qty_abs: Decimal::ZERO,
                last_price: Decimal::ZERO,
                last_at: now,
            });
            agg.qty_abs += exec.qty.abs();
            agg.last_price = exec.price;
            agg.last_at = now;
            debug!(symbol = %exec.symbol, total = %agg.qty_abs, "fill aggregated ahead of its snapshot");
            Vec::new()
        };

        // a real fill always settles whatever the snapshot had implied
        self.pending_opens.remove(&key);
        self.pending_reverses.remove(&key);
        self.update_gauges();
        out
    }

    pub fn on_order(&mut self, upd: &OrderUpdate) -> OrderOutcome {
        if upd.status.eq_ignore_ascii_case("pending") {
            debug!(id = upd.id, kind = %upd.kind, "order ignored (status pending)");
            return OrderOutcome::IgnoredPending;
        }

        let hash = dedup::content_hash(&upd.raw);
        if self.order_seen.contains(&hash) {
            return OrderOutcome::Duplicate;
        }

        let okey = OrderKey { id: upd.id, kind: upd.kind.clone() };
        match self.order_states.entry(okey) {
            Entry::Vacant(slot) => {
                if upd.oco.is_some() {
                    debug!(id = upd.id, kind = %upd.kind, oco = ?upd.oco, "new order ignored (oco leg)");
                    self.order_seen.insert(hash);
                    return OrderOutcome::IgnoredOco;
                }
                info!(id = upd.id, kind = %upd.kind, doc = %upd.raw, "new order");
                slot.insert(OrderState {
                    price: upd.price,
                    status: upd.status.clone(),
                    tp: upd.take_profit,
                    sl: upd.stop_loss,
                });
                self.order_seen.insert(hash);
                OrderOutcome::New
            }
            Entry::Occupied(mut slot) => {
                let prev = slot.get_mut();
                let changed = prev.price != upd.price
                    || !prev.status.eq_ignore_ascii_case(&upd.status)
                    || prev.tp != upd.take_profit
                    || prev.sl != upd.stop_loss;
                if !changed {
                    // same state under a new envelope: not worth remembering
                    debug!(id = upd.id, kind = %upd.kind, "order unchanged");
                    return OrderOutcome::Unchanged;
                }
                info!(
                    id = upd.id, kind = %upd.kind,
                    price = %format_args!("{} -> {}", prev.price, upd.price),
                    status = %format_args!("{} -> {}", prev.status, upd.status),
                    tp = %format_args!("{} -> {}", fmt_opt(prev.tp), fmt_opt(upd.take_profit)),
                    sl = %format_args!("{} -> {}", fmt_opt(prev.sl), fmt_opt(upd.stop_loss)),
                    "order updated"
                );
                prev.price = upd.price;
                prev.status = upd.status.clone();
                prev.tp = upd.take_profit;
                prev.sl = upd.stop_loss;
                if upd.status.eq_ignore_ascii_case("cancelled") {
                    warn!(id = upd.id, kind = %upd.kind, "order cancelled");
                }
                self.order_seen.insert(hash);
                OrderOutcome::Updated
            }
        }
    }

    /// Periodic sweep: settles adjustment bursts past the debounce window and
    /// resolves snapshot-implied pendings whose grace window ended. `force`
    /// flushes bursts immediately (shutdown, feed loss).
    pub fn flush(&mut self, now: Instant, force: bool) -> Vec<Call> {
        let mut out = Vec::new();

        for (key, st) in self.cycles.iter_mut() {
            if !st.has_pending() {
                continue;
            }
            let settled = st
                .pending_since
                .map_or(false, |t| now.duration_since(t) >= self.tun.adjust_debounce);
            if !(force || settled) {
                continue;
            }

            if !st.pending_infos.is_empty() {
                let mut infos = st.pending_infos.clone();
                dedup_in_order(&mut infos);
                info!(
                    symbol = %key.symbol, dir = ?st.dir, qty = %st.qty.abs(),
                    infos = %infos.join("; "),
                    "position adjusted"
                );
            }
            if st.pending_tp_changed {
                out.push(Call {
                    action: ActionCode::TakeProfitChange,
                    ticker: key.symbol.clone(),
                    price: st.last_avg,
                    position: st.qty,
                    exec_qty: Decimal::ZERO,
                    take_profit: st.tp_end,
                    stop_loss: st.sl_end,
                });
            }
            if st.pending_sl_changed {
                let action = if break_even(st.open_price, st.sl_end) {
                    ActionCode::BreakEvenStop
                } else {
                    ActionCode::StopLossChange
                };
                out.push(Call {
                    action,
                    ticker: key.symbol.clone(),
                    price: st.last_avg,
                    position: st.qty,
                    exec_qty: Decimal::ZERO,
                    take_profit: st.tp_end,
                    stop_loss: st.sl_end,
                });
            }

            st.pending_infos.clear();
            st.pending_sl_changed = false;
            st.pending_tp_changed = false;
            st.pending_since = None;
        }

        // Snapshot-implied opens and reverses: a fill emission near their
        // creation cancels them, the deadline passing emits them with qty 0.
        out.extend(sweep_pending(&mut self.pending_opens, &self.last_fill_emit, self.tun.exec_grace, now));
        out.extend(sweep_pending(&mut self.pending_reverses, &self.last_fill_emit, self.tun.exec_grace, now));

        self.update_gauges();
        out
    }

    fn take_fresh_agg(&mut self, key: &PositionKey, now: Instant) -> Option<EarlyAgg> {
        let fresh = self.early_exec.get(key).map_or(false, |agg| {
            agg.qty_abs > Decimal::ZERO && now.duration_since(agg.last_at) <= self.tun.exec_grace
        });
        if fresh { self.early_exec.remove(key) } else { None }
    }

    fn update_gauges(&self) {
        metrics::OPEN_CYCLES.set(self.cycles.len() as i64);
        metrics::PENDING.with_label_values(&["open"]).set(self.pending_opens.len() as i64);
        metrics::PENDING.with_label_values(&["reverse"]).set(self.pending_reverses.len() as i64);
        metrics::PENDING.with_label_values(&["early_fill"]).set(self.early_exec.len() as i64);
    }
}

fn sweep_pending(
    pending: &mut AHashMap<PositionKey, PendingAction>,
    last_fill_emit: &AHashMap<PositionKey, Instant>,
    grace: Duration,
    now: Instant,
) -> Vec<Call> {
    let mut out = Vec::new();
    pending.retain(|key, pa| {
        if let Some(last) = last_fill_emit.get(key) {
            if abs_delta(pa.created_at, *last) <= grace {
                debug!(symbol = %pa.symbol, "pending action dropped, a fill emission already covers it");
                return false;
            }
        }
        if now >= pa.deadline {
            out.push(Call {
                action: pa.action,
                ticker: pa.symbol.clone(),
                price: pa.avg,
                position: pa.position,
                exec_qty: Decimal::ZERO,
                take_profit: pa.tp,
                stop_loss: pa.sl,
            });
            return false;
        }
        true
    });
    out
}

fn abs_delta(a: Instant, b: Instant) -> Duration {
    if a >= b { a - b } else { b - a }
}

fn break_even(open_price: Decimal, sl: Option<Decimal>) -> bool {
    sl.map_or(false, |v| v == open_price)
}

fn dedup_in_order(notes: &mut Vec<String>) {
    let mut seen = AHashSet::new();
    notes.retain(|n| seen.insert(n.clone()));
}

/// Pushes calls to the delivery queue and the recorder. Delivery never blocks
/// the engine; a full queue drops the call and says so.
pub(crate) fn forward_calls(calls: Vec<Call>, call_tx: &mpsc::Sender<Call>, rec_tx: &mpsc::Sender<Event>) {
    for call in calls {
        metrics::CALLS.inc();
        metrics::CALLS_BY_ACTION.with_label_values(&[call.action.label()]).inc();
        let _ = rec_tx.try_send(Event::Call(call.clone()));
        if let Err(e) = call_tx.try_send(call) {
            metrics::CALLS_DROPPED.inc();
            error!(?e, "call queue full, dropping action");
        }
    }
}

pub async fn run(
    mut rx: mpsc::Receiver<FeedEvent>,
    call_tx: mpsc::Sender<Call>,
    rec_tx: mpsc::Sender<Event>,
    tun: Tunables,
) {
    let mut eng = StreamEngine::new(tun.clone());
    let mut tick = tokio::time::interval(tun.flush_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("stream engine started");

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(ev) => {
                    let calls = dispatch(&mut eng, ev, &rec_tx);
                    forward_calls(calls, &call_tx, &rec_tx);
                }
                None => {
                    let calls = eng.flush(Instant::now(), true);
                    forward_calls(calls, &call_tx, &rec_tx);
                    info!("stream engine stopped, feed channel closed");
                    break;
                }
            },
            _ = tick.tick() => {
                let calls = eng.flush(Instant::now(), false);
                forward_calls(calls, &call_tx, &rec_tx);
            }
        }
    }
}

fn dispatch(eng: &mut StreamEngine, ev: FeedEvent, rec_tx: &mpsc::Sender<Event>) -> Vec<Call> {
    let now = Instant::now();
    match ev {
        FeedEvent::Position(snap) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["position"]).inc();
            let _ = rec_tx.try_send(Event::Pos(snap.clone()));
            eng.on_position(&snap, now)
        }
        FeedEvent::Execution(exec) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["execution"]).inc();
            let _ = rec_tx.try_send(Event::Fill(exec.clone()));
            eng.on_execution(&exec, now)
        }
        FeedEvent::Order(upd) => {
            metrics::EVENTS_BY_TYPE.with_label_values(&["order"]).inc();
            let outcome = eng.on_order(&upd);
            metrics::ORDER_OUTCOMES.with_label_values(&[outcome.label()]).inc();
            if matches!(outcome, OrderOutcome::New | OrderOutcome::Updated) {
                let _ = rec_tx.try_send(Event::Ord(upd));
            }
            Vec::new()
        }
        FeedEvent::Disconnected => {
            warn!("feed disconnected, forcing adjustment flush");
            eng.flush(now, true)
        }
        // polled pages never reach this engine
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eng() -> StreamEngine {
        StreamEngine::new(Tunables::default())
    }

    fn snap(qty: Decimal, avg: Decimal) -> PositionSnapshot {
        snap_levels(qty, avg, None, None)
    }

    fn snap_levels(
        qty: Decimal,
        avg: Decimal,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> PositionSnapshot {
        PositionSnapshot {
            account: 7,
            symbol: "EURUSD".to_string(),
            qty,
            avg_price: avg,
            stop_loss: sl,
            take_profit: tp,
        }
    }

    fn fill(side: Side, qty: Decimal, price: Decimal) -> ExecutionEvent {
        ExecutionEvent { account: 7, symbol: "EURUSD".to_string(), side, qty, price }
    }

    fn order(id: i64, kind: &str, price: Decimal, status: &str) -> OrderUpdate {
        OrderUpdate {
            id,
            kind: kind.to_string(),
            price,
            status: status.to_string(),
            take_profit: None,
            stop_loss: None,
            oco: None,
            raw: format!(r#"{{"id":{id},"type":"{kind}","price":"{price}","status":"{status}"}}"#),
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn count_opens_closes(calls: &[Call], opens: &mut usize, closes: &mut usize) {
        for c in calls {
            match c.action {
                ActionCode::Close => *closes += 1,
                ActionCode::OpenLong | ActionCode::OpenShort => *opens += 1,
                _ => {}
            }
        }
    }

    #[test]
    fn test_snapshot_open_emits_after_grace() {
        let mut e = eng();
        let t0 = Instant::now();
        assert!(e.on_position(&snap(dec!(5), dec!(100)), t0).is_empty());
        assert!(e.flush(t0 + ms(100), false).is_empty());

        let calls = e.flush(t0 + ms(500), false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::OpenLong);
        assert_eq!(calls[0].exec_qty, dec!(0));
        assert_eq!(calls[0].position, dec!(5));
        assert_eq!(calls[0].price, dec!(100));

        // one-shot: the pending entry is gone
        assert!(e.flush(t0 + ms(900), false).is_empty());
    }

    #[test]
    fn test_fill_within_grace_supersedes_snapshot_open() {
        let mut e = eng();
        let t0 = Instant::now();
        assert!(e.on_position(&snap(dec!(5), dec!(100)), t0).is_empty());

        let calls = e.on_execution(&fill(Side::Buy, dec!(5), dec!(100)), t0 + ms(50));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::OpenLong);
        assert_eq!(calls[0].exec_qty, dec!(5));

        // the snapshot-implied open must not fire a second time
        assert!(e.flush(t0 + ms(1000), false).is_empty());
    }

    #[test]
    fn test_early_fills_consolidate_into_open() {
        let mut e = eng();
        let t0 = Instant::now();
        assert!(e.on_execution(&fill(Side::Buy, dec!(2), dec!(99)), t0).is_empty());
        assert!(e.on_execution(&fill(Side::Buy, dec!(3), dec!(100)), t0 + ms(20)).is_empty());

        let calls = e.on_position(&snap(dec!(5), dec!(100)), t0 + ms(40));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::OpenLong);
        assert_eq!(calls[0].exec_qty, dec!(5));
        assert_eq!(calls[0].position, dec!(5));
        assert!(e.flush(t0 + ms(1000), false).is_empty());
    }

    #[test]
    fn test_round_trip_fills_without_snapshot_close_once() {
        let mut e = eng();
        let t0 = Instant::now();
        assert!(e.on_execution(&fill(Side::Buy, dec!(2), dec!(101)), t0).is_empty());
        assert!(e.on_execution(&fill(Side::Sell, dec!(2), dec!(102)), t0 + ms(30)).is_empty());

        let calls = e.on_position(&snap(dec!(0), dec!(0)), t0 + ms(60));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::Close);
        assert_eq!(calls[0].exec_qty, dec!(4));
        assert_eq!(calls[0].price, dec!(102));

        // aggregate consumed: a second flat snapshot is silent
        assert!(e.on_position(&snap(dec!(0), dec!(0)), t0 + ms(90)).is_empty());
    }

    #[test]
    fn test_reversal_emits_close_then_reverse() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap(dec!(5), dec!(100)), t0);
        let opened = e.flush(t0 + ms(500), false);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].action, ActionCode::OpenLong);

        let calls = e.on_position(&snap(dec!(-3), dec!(101)), t0 + ms(600));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::Close);
        assert_eq!(calls[0].exec_qty, dec!(5));

        let flushed = e.flush(t0 + ms(1100), false);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].action, ActionCode::ReverseShort);
        assert_eq!(flushed[0].position, dec!(-3));
        assert_eq!(flushed[0].exec_qty, dec!(0));
    }

    #[test]
    fn test_open_close_counts_match_transitions() {
        let mut e = eng();
        let t0 = Instant::now();
        let mut opens = 0;
        let mut closes = 0;

        // 0 -> 5 -> 5 (noise) -> 0 -> 0 (noise) -> -2 -> 0
        let series = [dec!(5), dec!(5), dec!(0), dec!(0), dec!(-2), dec!(0)];
        for (i, q) in series.iter().enumerate() {
            let now = t0 + ms(i as u64 * 700);
            let calls = e.on_position(&snap(*q, dec!(100)), now);
            count_opens_closes(&calls, &mut opens, &mut closes);
            let calls = e.flush(now + ms(600), false);
            count_opens_closes(&calls, &mut opens, &mut closes);
        }

        assert_eq!(opens, 2);
        assert_eq!(closes, 2);
    }

    #[test]
    fn test_sl_burst_flushes_once_with_final_value() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap_levels(dec!(5), dec!(100), Some(dec!(95)), None), t0);
        e.on_execution(&fill(Side::Buy, dec!(5), dec!(100)), t0);

        for (i, sl) in [dec!(96), dec!(97), dec!(98)].iter().enumerate() {
            let now = t0 + ms(200 + i as u64 * 100);
            assert!(e
                .on_position(&snap_levels(dec!(5), dec!(100), Some(*sl), None), now)
                .is_empty());
        }

        // burst started at +200ms; the debounce has not settled yet
        assert!(e.flush(t0 + ms(600), false).is_empty());

        let calls = e.flush(t0 + ms(1000), false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::StopLossChange);
        assert_eq!(calls[0].stop_loss, Some(dec!(98)));
        assert!(e.flush(t0 + ms(2000), false).is_empty());
    }

    #[test]
    fn test_stop_moved_to_entry_flushes_as_break_even() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap_levels(dec!(5), dec!(100), Some(dec!(95)), None), t0);
        e.on_execution(&fill(Side::Buy, dec!(5), dec!(100)), t0);
        e.on_position(&snap_levels(dec!(5), dec!(100), Some(dec!(100)), None), t0 + ms(300));

        let calls = e.flush(t0 + ms(1200), false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::BreakEvenStop);
        assert_eq!(calls[0].stop_loss, Some(dec!(100)));
    }

    #[test]
    fn test_tp_cancel_then_set_flush_separately() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap_levels(dec!(5), dec!(100), None, Some(dec!(110))), t0);
        e.on_execution(&fill(Side::Buy, dec!(5), dec!(100)), t0);

        e.on_position(&snap_levels(dec!(5), dec!(100), None, None), t0 + ms(300));
        let calls = e.flush(t0 + ms(1200), false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::TakeProfitChange);
        assert_eq!(calls[0].take_profit, None);

        e.on_position(&snap_levels(dec!(5), dec!(100), None, Some(dec!(111))), t0 + ms(1300));
        let calls = e.flush(t0 + ms(2100), false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::TakeProfitChange);
        assert_eq!(calls[0].take_profit, Some(dec!(111)));
    }

    #[test]
    fn test_rapid_fills_coalesce_within_window() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap(dec!(5), dec!(100)), t0);
        let first = e.on_execution(&fill(Side::Buy, dec!(2), dec!(100)), t0 + ms(10));
        assert_eq!(first.len(), 1);

        // 40ms later: swallowed by the coalescing window
        assert!(e.on_execution(&fill(Side::Buy, dec!(1), dec!(100)), t0 + ms(50)).is_empty());

        // well past the window: emitted
        let third = e.on_execution(&fill(Side::Buy, dec!(2), dec!(100)), t0 + ms(200));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].exec_qty, dec!(2));
    }

    #[test]
    fn test_pending_reverse_cancelled_by_adjacent_fill() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap(dec!(5), dec!(100)), t0);
        let _ = e.flush(t0 + ms(500), false);
        let _ = e.on_execution(&fill(Side::Buy, dec!(1), dec!(100)), t0 + ms(600));

        let calls = e.on_position(&snap(dec!(-3), dec!(101)), t0 + ms(700));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::Close);

        // the fill emission at +600ms sits inside the grace window of the
        // pending reverse created at +700ms, so the reverse is swallowed
        assert!(e.flush(t0 + ms(1300), false).is_empty());
    }

    #[test]
    fn test_force_flush_skips_the_debounce() {
        let mut e = eng();
        let t0 = Instant::now();
        e.on_position(&snap_levels(dec!(5), dec!(100), Some(dec!(95)), None), t0);
        e.on_execution(&fill(Side::Buy, dec!(5), dec!(100)), t0);
        e.on_position(&snap_levels(dec!(5), dec!(100), Some(dec!(96)), None), t0 + ms(50));

        let calls = e.flush(t0 + ms(60), true);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, ActionCode::StopLossChange);
        assert_eq!(calls[0].stop_loss, Some(dec!(96)));
    }

    #[test]
    fn test_duplicate_order_documents_collapse() {
        let mut e = eng();
        let upd = order(1001, "limit", dec!(110), "working");
        assert_eq!(e.on_order(&upd), OrderOutcome::New);
        assert_eq!(e.on_order(&upd), OrderOutcome::Duplicate);

        let mut upd2 = order(1001, "limit", dec!(111), "working");
        assert_eq!(e.on_order(&upd2), OrderOutcome::Updated);

        // same state under a different envelope: unchanged, and replaying the
        // same envelope stays unchanged because no-change documents are not
        // added to the seen set
        upd2.raw.push(' ');
        assert_eq!(e.on_order(&upd2), OrderOutcome::Unchanged);
        assert_eq!(e.on_order(&upd2), OrderOutcome::Unchanged);
    }

    #[test]
    fn test_oco_leg_and_pending_status_ignored() {
        let mut e = eng();
        let mut upd = order(2002, "stop", dec!(95), "working");
        upd.oco = Some("2003".to_string());
        assert_eq!(e.on_order(&upd), OrderOutcome::IgnoredOco);
        // the oco document was hashed, so its replay is a duplicate
        assert_eq!(e.on_order(&upd), OrderOutcome::Duplicate);

        let pending = order(2004, "limit", dec!(96), "pending");
        assert_eq!(e.on_order(&pending), OrderOutcome::IgnoredPending);
        assert_eq!(e.on_order(&pending), OrderOutcome::IgnoredPending);
    }
}
