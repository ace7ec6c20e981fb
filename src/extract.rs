// ===============================
// src/extract.rs
// ===============================
//
// Tolerant field readers over serde_json::Value. The upstream feed mixes
// numeric and string encodings for the same fields, omits fields at will,
// and sometimes string-encodes a whole payload one level deep.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

fn dec_from(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s).or_else(|_| Decimal::from_scientific(&s)).ok()
        }
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
        }
        _ => None,
    }
}

/// Missing, null, or unparseable reads as zero.
pub fn dec_or_zero(obj: &Value, name: &str) -> Decimal {
    obj.get(name).and_then(dec_from).unwrap_or(Decimal::ZERO)
}

/// Missing, null, or unparseable reads as None.
pub fn dec_nullable(obj: &Value, name: &str) -> Option<Decimal> {
    match obj.get(name) {
        None | Some(Value::Null) => None,
        Some(v) => dec_from(v),
    }
}

/// Order-channel optional level: a present-but-null field still counts as
/// present (zero); only a missing field reads as None.
pub fn dec_field(obj: &Value, name: &str) -> Option<Decimal> {
    match obj.get(name) {
        None => None,
        Some(Value::Null) => Some(Decimal::ZERO),
        Some(v) => Some(dec_from(v).unwrap_or(Decimal::ZERO)),
    }
}

/// Identifier that may arrive as a JSON number or a numeric string.
pub fn id_i64(obj: &Value, name: &str) -> Option<i64> {
    match obj.get(name)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Identifier normalized to a non-empty string.
pub fn id_string(obj: &Value, name: &str) -> Option<String> {
    match obj.get(name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => n.as_i64().map(|v| v.to_string()),
        _ => None,
    }
}

/// Epoch seconds; fractional stamps floor to the containing second.
pub fn epoch_sec(obj: &Value, name: &str) -> Option<i64> {
    match obj.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64)),
        _ => None,
    }
}

pub fn str_or_empty<'a>(obj: &'a Value, name: &str) -> &'a str {
    obj.get(name).and_then(Value::as_str).unwrap_or("")
}

/// Unwraps a payload document: a string-encoded document is parsed one level
/// deep, then the `p` member is taken when present (the document itself
/// otherwise). Returns (document, payload).
pub fn unwrap_payload(content: &Value) -> Option<(Value, Value)> {
    let root = match content {
        Value::String(s) if !s.trim().is_empty() => serde_json::from_str::<Value>(s).ok()?,
        other => other.clone(),
    };
    let p = match root.get("p") {
        Some(p) if p.is_object() => p.clone(),
        _ if root.is_object() => root.clone(),
        _ => return None,
    };
    Some((root, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_dec_or_zero_accepts_numbers_and_strings() {
        let v = json!({"a": 1.5, "b": "2.25", "c": "junk"});
        assert_eq!(dec_or_zero(&v, "a"), dec!(1.5));
        assert_eq!(dec_or_zero(&v, "b"), dec!(2.25));
        assert_eq!(dec_or_zero(&v, "c"), dec!(0));
        assert_eq!(dec_or_zero(&v, "missing"), dec!(0));
    }

    #[test]
    fn test_dec_nullable_distinguishes_null_from_garbage() {
        let v = json!({"a": null, "b": "3", "c": {}});
        assert_eq!(dec_nullable(&v, "a"), None);
        assert_eq!(dec_nullable(&v, "b"), Some(dec!(3)));
        assert_eq!(dec_nullable(&v, "c"), None);
        assert_eq!(dec_nullable(&v, "missing"), None);
    }

    #[test]
    fn test_dec_field_treats_null_as_present_zero() {
        let v = json!({"tp": null, "sl": 95.5});
        assert_eq!(dec_field(&v, "tp"), Some(dec!(0)));
        assert_eq!(dec_field(&v, "sl"), Some(dec!(95.5)));
        assert_eq!(dec_field(&v, "missing"), None);
    }

    #[test]
    fn test_id_string_normalizes_numbers() {
        let v = json!({"a": 42, "b": "x1", "c": "  "});
        assert_eq!(id_string(&v, "a"), Some("42".to_string()));
        assert_eq!(id_string(&v, "b"), Some("x1".to_string()));
        assert_eq!(id_string(&v, "c"), None);
    }

    #[test]
    fn test_unwrap_payload_parses_string_encoded_documents() {
        let v = json!({"m": "order_update", "d": "{\"p\":{\"id\":7}}"});
        let (root, p) = unwrap_payload(&v["d"]).unwrap();
        assert_eq!(p["id"], 7);
        assert!(root.get("p").is_some());
    }

    #[test]
    fn test_unwrap_payload_falls_back_to_the_document_itself() {
        let v = json!({"id": 9, "price": 1.0});
        let (_, p) = unwrap_payload(&v).unwrap();
        assert_eq!(p["id"], 9);
    }
}
