// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }

impl Side {
    pub fn sign(&self) -> i32 { match self { Side::Buy => 1, Side::Sell => -1 } }

    /// Feed convention: a fill whose side is not "buy" is a sell.
    pub fn from_feed(s: &str) -> Side {
        if s.eq_ignore_ascii_case("buy") { Side::Buy } else { Side::Sell }
    }

    pub fn parse(s: &str) -> Option<Side> {
        if s.eq_ignore_ascii_case("buy") { Some(Side::Buy) }
        else if s.eq_ignore_ascii_case("sell") { Some(Side::Sell) }
        else { None }
    }
}

/// Canonical action codes understood by the downstream executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionCode {
    Close,
    OpenLong,
    OpenShort,
    BreakEvenStop,
    ReverseLong,
    ReverseShort,
    TakeProfitChange,
    StopLossChange,
}

impl ActionCode {
    pub fn wire(self) -> u8 {
        match self {
            ActionCode::Close => 0,
            ActionCode::OpenLong => 1,
            ActionCode::OpenShort => 2,
            ActionCode::BreakEvenStop => 3,
            ActionCode::ReverseLong => 4,
            ActionCode::ReverseShort => 5,
            ActionCode::TakeProfitChange => 6,
            ActionCode::StopLossChange => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ActionCode::Close => "close",
            ActionCode::OpenLong => "open_long",
            ActionCode::OpenShort => "open_short",
            ActionCode::BreakEvenStop => "break_even",
            ActionCode::ReverseLong => "reverse_long",
            ActionCode::ReverseShort => "reverse_short",
            ActionCode::TakeProfitChange => "tp_change",
            ActionCode::StopLossChange => "sl_change",
        }
    }

    /// Fill-style action for a given side (also used for opens).
    pub fn fill(side: Side) -> ActionCode {
        match side { Side::Buy => ActionCode::OpenLong, Side::Sell => ActionCode::OpenShort }
    }

    pub fn reverse(side: Side) -> ActionCode {
        match side { Side::Buy => ActionCode::ReverseLong, Side::Sell => ActionCode::ReverseShort }
    }
}

/// One normalized outbound action. `price` rides in the wire field `close`;
/// `position` is the signed net position after the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub action: ActionCode,
    pub ticker: String,
    pub price: Decimal,
    pub position: Decimal,
    pub exec_qty: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

/// One reconciliation unit on the push-stream feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub account: i64,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub account: i64,
    pub symbol: String,
    pub qty: Decimal,
    pub avg_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub account: i64,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
}

/// Order-channel update. `take_profit`/`stop_loss` read `Some(0)` when the
/// feed sends an explicit null; `raw` is the normalized source document used
/// for duplicate detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub id: i64,
    pub kind: String,
    pub price: Decimal,
    pub status: String,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub oco: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolledPosition {
    pub instrument: String,
    pub signed_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind { Limit, Stop, Other }

impl OrderKind {
    pub fn from_feed(s: &str) -> OrderKind {
        if s.eq_ignore_ascii_case("limit") { OrderKind::Limit }
        else if s.eq_ignore_ascii_case("stop") { OrderKind::Stop }
        else { OrderKind::Other }
    }
}

/// One resting order from the polled order book, already filtered to
/// working status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub kind: OrderKind,
    pub side: Option<Side>,
    pub limit: Option<Decimal>,
    pub stop: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolledExecution {
    pub id: String,
    pub instrument: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub time_sec: Option<i64>,
}

/// Classified inbound document, queued from the transport adapter to the
/// engine. Polled order rows arrive flat as (instrument, order) pairs.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Position(PositionSnapshot),
    Execution(ExecutionEvent),
    Order(OrderUpdate),
    PolledPositions(Vec<PolledPosition>),
    PolledOrders(Vec<(String, WorkingOrder)>),
    PolledExecutions(Vec<PolledExecution>),
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Pos(PositionSnapshot),
    Fill(ExecutionEvent),
    Ord(OrderUpdate),
    Call(Call),
    Note(String),
}

pub fn fmt_opt(v: Option<Decimal>) -> String {
    v.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(ActionCode::Close.wire(), 0);
        assert_eq!(ActionCode::OpenLong.wire(), 1);
        assert_eq!(ActionCode::OpenShort.wire(), 2);
        assert_eq!(ActionCode::BreakEvenStop.wire(), 3);
        assert_eq!(ActionCode::ReverseLong.wire(), 4);
        assert_eq!(ActionCode::ReverseShort.wire(), 5);
        assert_eq!(ActionCode::TakeProfitChange.wire(), 6);
        assert_eq!(ActionCode::StopLossChange.wire(), 7);
    }

    #[test]
    fn test_side_from_feed_defaults_to_sell() {
        assert_eq!(Side::from_feed("buy"), Side::Buy);
        assert_eq!(Side::from_feed("BUY"), Side::Buy);
        assert_eq!(Side::from_feed("sell"), Side::Sell);
        // anything unrecognized fills as a sell
        assert_eq!(Side::from_feed(""), Side::Sell);
    }

    #[test]
    fn test_side_parse_is_strict() {
        assert_eq!(Side::parse("Sell"), Some(Side::Sell));
        assert_eq!(Side::parse("short"), None);
    }
}
