// ===============================
// src/classify.rs
// ===============================
//
// Turns raw transport documents into typed feed events.
//
// Stream documents wrap a trading-channel envelope:
//   {"text": {"channel": "trading", "content": {"m": "<type>", ...}}}
// Polled documents arrive as {"key": "<endpoint url>", "body": {"d": [...]}}
// where the endpoint family is matched by path substring, case-insensitive.

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    ExecutionEvent, FeedEvent, OrderKind, OrderUpdate, PolledExecution, PolledPosition,
    PositionSnapshot, Side, WorkingOrder,
};
use crate::extract;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum Classified {
    Event(FeedEvent),
    /// Dropped without effect; the tag feeds the drop metric.
    Ignored(&'static str),
}

pub fn stream_line(raw: &str) -> Result<Classified, ClassifyError> {
    let doc: Value = serde_json::from_str(raw)?;

    let Some(text) = doc.get("text") else {
        return Ok(Classified::Ignored("no_text"));
    };
    if let Some(s) = text.as_str() {
        debug!(msg = %s, "ignoring plain-string frame");
        return Ok(Classified::Ignored("string_text"));
    }
    if let Some(ch) = text.get("channel").and_then(Value::as_str) {
        if ch != "trading" {
            return Ok(Classified::Ignored("channel"));
        }
    }
    let Some(content) = text.get("content") else {
        return Ok(Classified::Ignored("no_content"));
    };
    let Some(kind) = content.get("m").and_then(Value::as_str) else {
        return Ok(Classified::Ignored("no_type"));
    };

    match kind {
        "position_update" => Ok(position_event(content)),
        "execution_update" => Ok(execution_event(content)),
        "order_update" => Ok(order_event(content)),
        "journal_update" => Ok(Classified::Ignored("journal")),
        other => {
            debug!(kind = %other, "ignoring unhandled event type");
            Ok(Classified::Ignored("other"))
        }
    }
}

fn position_event(content: &Value) -> Classified {
    let Some((_, p)) = extract::unwrap_payload(content) else {
        return Classified::Ignored("no_payload");
    };
    Classified::Event(FeedEvent::Position(PositionSnapshot {
        account: extract::id_i64(&p, "account").unwrap_or(0),
        symbol: extract::str_or_empty(&p, "symbol").to_string(),
        qty: extract::dec_or_zero(&p, "qty"),
        avg_price: extract::dec_or_zero(&p, "avg_price"),
        stop_loss: extract::dec_nullable(&p, "sl"),
        take_profit: extract::dec_nullable(&p, "tp"),
    }))
}

fn execution_event(content: &Value) -> Classified {
    // fills without a numeric accountId cannot be keyed and are dropped
    let Some(account) = content.get("accountId").and_then(Value::as_i64) else {
        return Classified::Ignored("no_account");
    };
    let Some(p) = content.get("p").filter(|v| v.is_object()) else {
        return Classified::Ignored("no_payload");
    };
    Classified::Event(FeedEvent::Execution(ExecutionEvent {
        account,
        symbol: extract::str_or_empty(p, "symbol").to_string(),
        side: Side::from_feed(extract::str_or_empty(p, "side")),
        qty: extract::dec_or_zero(p, "qty"),
        price: extract::dec_or_zero(p, "price"),
    }))
}

fn order_event(content: &Value) -> Classified {
    let Some((root, p)) = extract::unwrap_payload(content) else {
        return Classified::Ignored("no_payload");
    };
    // id, type and price are the identity core; anything short of that is noise
    let Some(id) = extract::id_i64(&p, "id") else {
        return Classified::Ignored("order_core");
    };
    let Some(kind) = p.get("type").and_then(Value::as_str) else {
        return Classified::Ignored("order_core");
    };
    let Some(price) = extract::dec_nullable(&p, "price") else {
        return Classified::Ignored("order_core");
    };
    let oco = p
        .get("oco")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string());

    Classified::Event(FeedEvent::Order(OrderUpdate {
        id,
        kind: kind.to_string(),
        price,
        status: extract::str_or_empty(&p, "status").to_string(),
        take_profit: extract::dec_field(&p, "tp"),
        stop_loss: extract::dec_field(&p, "sl"),
        oco,
        raw: serde_json::to_string(&root).unwrap_or_default(),
    }))
}

pub fn polled_line(raw: &str) -> Result<Classified, ClassifyError> {
    let doc: Value = serde_json::from_str(raw)?;
    let Some(key) = doc.get("key").and_then(Value::as_str) else {
        return Ok(Classified::Ignored("envelope"));
    };
    let Some(body) = doc.get("body") else {
        return Ok(Classified::Ignored("envelope"));
    };
    Ok(classify_polled(key, body))
}

pub fn classify_polled(key: &str, body: &Value) -> Classified {
    let Some(rows) = body.get("d").and_then(Value::as_array) else {
        return Classified::Ignored("no_rows");
    };
    let path = key.to_ascii_lowercase();
    if path.contains("/positions?") {
        Classified::Event(FeedEvent::PolledPositions(position_rows(rows)))
    } else if path.contains("/orders?") {
        Classified::Event(FeedEvent::PolledOrders(order_rows(rows)))
    } else if path.contains("/executions?") {
        Classified::Event(FeedEvent::PolledExecutions(execution_rows(rows)))
    } else {
        debug!(%key, "ignoring unmatched endpoint");
        Classified::Ignored("endpoint")
    }
}

fn position_rows(rows: &[Value]) -> Vec<PolledPosition> {
    let mut out = Vec::with_capacity(rows.len());
    for el in rows {
        let instrument = extract::str_or_empty(el, "instrument");
        if instrument.trim().is_empty() {
            continue;
        }
        let qty = extract::dec_or_zero(el, "qty");
        let signed_qty = match Side::parse(extract::str_or_empty(el, "side")) {
            Some(s) => Decimal::from(s.sign()) * qty,
            None => Decimal::ZERO,
        };
        out.push(PolledPosition {
            instrument: instrument.to_string(),
            signed_qty,
            avg_price: extract::dec_or_zero(el, "avgPrice"),
        });
    }
    out
}

fn order_rows(rows: &[Value]) -> Vec<(String, WorkingOrder)> {
    let mut out = Vec::new();
    for el in rows {
        if !extract::str_or_empty(el, "status").eq_ignore_ascii_case("working") {
            continue;
        }
        let instrument = extract::str_or_empty(el, "instrument");
        if instrument.trim().is_empty() {
            continue;
        }
        let kind = OrderKind::from_feed(extract::str_or_empty(el, "type"));
        let mut limit = extract::dec_nullable(el, "limitPrice");
        let mut stop = extract::dec_nullable(el, "stopPrice");
        // some gateways collapse the level into a bare "price" field
        if limit.is_none() && stop.is_none() {
            if let Some(px) = extract::dec_nullable(el, "price") {
                if kind == OrderKind::Limit { limit = Some(px) } else { stop = Some(px) }
            }
        }
        out.push((
            instrument.to_string(),
            WorkingOrder { kind, side: Side::parse(extract::str_or_empty(el, "side")), limit, stop },
        ));
    }
    out
}

fn execution_rows(rows: &[Value]) -> Vec<PolledExecution> {
    let mut out = Vec::with_capacity(rows.len());
    for el in rows {
        let Some(id) = extract::id_string(el, "id") else { continue };
        out.push(PolledExecution {
            id,
            instrument: extract::str_or_empty(el, "instrument").to_string(),
            side: Side::from_feed(extract::str_or_empty(el, "side")),
            qty: extract::dec_or_zero(el, "qty"),
            price: extract::dec_or_zero(el, "price"),
            time_sec: extract::epoch_sec(el, "time"),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_non_trading_channel_is_ignored() {
        let raw = r#"{"text":{"channel":"chat","content":{"m":"position_update"}}}"#;
        assert!(matches!(stream_line(raw), Ok(Classified::Ignored("channel"))));
    }

    #[test]
    fn test_plain_string_text_is_ignored() {
        let raw = r#"{"text":"hello"}"#;
        assert!(matches!(stream_line(raw), Ok(Classified::Ignored("string_text"))));
    }

    #[test]
    fn test_position_update_parses_nullable_levels() {
        let raw = r#"{"text":{"channel":"trading","content":{"m":"position_update",
            "p":{"account":7,"symbol":"EURUSD","qty":"5","avg_price":1.1,"sl":null,"tp":1.2}}}}"#;
        let Ok(Classified::Event(FeedEvent::Position(p))) = stream_line(raw) else {
            panic!("expected a position event");
        };
        assert_eq!(p.account, 7);
        assert_eq!(p.qty, dec!(5));
        assert_eq!(p.stop_loss, None);
        assert_eq!(p.take_profit, Some(dec!(1.2)));
    }

    #[test]
    fn test_execution_without_account_is_dropped() {
        let raw = r#"{"text":{"channel":"trading","content":{"m":"execution_update",
            "p":{"symbol":"EURUSD","side":"buy","qty":1,"price":1.1}}}}"#;
        assert!(matches!(stream_line(raw), Ok(Classified::Ignored("no_account"))));
    }

    #[test]
    fn test_order_update_with_string_encoded_payload() {
        let raw = r#"{"text":{"channel":"trading","content":{"m":"order_update",
            "d":"ignored","p":{"id":"42","type":"limit","price":"1.25","status":"working","tp":null}}}}"#;
        let Ok(Classified::Event(FeedEvent::Order(o))) = stream_line(raw) else {
            panic!("expected an order event");
        };
        assert_eq!(o.id, 42);
        assert_eq!(o.price, dec!(1.25));
        assert_eq!(o.take_profit, Some(dec!(0)));
        assert_eq!(o.stop_loss, None);
        assert!(!o.raw.is_empty());
    }

    #[test]
    fn test_order_without_core_fields_is_noise() {
        let raw = r#"{"text":{"channel":"trading","content":{"m":"order_update",
            "p":{"id":42,"type":"limit"}}}}"#;
        assert!(matches!(stream_line(raw), Ok(Classified::Ignored("order_core"))));
    }

    #[test]
    fn test_polled_families_match_case_insensitive() {
        let raw = r#"{"key":"https://x/Positions?acc=1","body":{"s":"ok","d":[
            {"instrument":"NQZ5","side":"Buy","qty":2,"avgPrice":15000.25}]}}"#;
        let Ok(Classified::Event(FeedEvent::PolledPositions(rows))) = polled_line(raw) else {
            panic!("expected polled positions");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].signed_qty, dec!(2));
        assert_eq!(rows[0].avg_price, dec!(15000.25));
    }

    #[test]
    fn test_polled_orders_keep_only_working_rows() {
        let raw = r#"{"key":"https://x/orders?acc=1","body":{"d":[
            {"instrument":"NQZ5","status":"working","type":"limit","side":"sell","limitPrice":15100},
            {"instrument":"NQZ5","status":"filled","type":"limit","side":"sell","limitPrice":15100},
            {"instrument":"NQZ5","status":"Working","type":"stop","side":"sell","price":14900}]}}"#;
        let Ok(Classified::Event(FeedEvent::PolledOrders(rows))) = polled_line(raw) else {
            panic!("expected polled orders");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1.limit, Some(dec!(15100)));
        // bare "price" on a stop order lands in the stop slot
        assert_eq!(rows[1].1.stop, Some(dec!(14900)));
    }

    #[test]
    fn test_polled_executions_require_an_id() {
        let raw = r#"{"key":"https://x/executions?acc=1","body":{"d":[
            {"instrument":"NQZ5","side":"buy","qty":1,"price":15000,"time":1700000000},
            {"id":9001,"instrument":"NQZ5","side":"buy","qty":1,"price":15000,"time":1700000000.9}]}}"#;
        let Ok(Classified::Event(FeedEvent::PolledExecutions(rows))) = polled_line(raw) else {
            panic!("expected polled executions");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "9001");
        assert_eq!(rows[0].time_sec, Some(1700000000));
    }

    #[test]
    fn test_unmatched_endpoint_is_ignored() {
        let raw = r#"{"key":"https://x/accounts?x=1","body":{"d":[]}}"#;
        assert!(matches!(polled_line(raw), Ok(Classified::Ignored("endpoint"))));
    }
}
