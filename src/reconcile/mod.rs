//! Reconciliation: provider payloads → normalized rows → idempotent upserts.
//!
//! Providers hand raw JSON (or assembled bulk records) to this layer, which
//! derives the natural key, normalizes money/timestamps, and feeds the store
//! upserts. Malformed records are skipped and logged, never fatal here.

pub mod orders;
pub mod products;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

pub(crate) fn v_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

pub(crate) fn v_i64(v: &Value, key: &str) -> Option<i64> {
    let x = v.get(key)?;
    if let Some(n) = x.as_i64() {
        return Some(n);
    }
    x.as_str().and_then(|s| s.parse().ok())
}

pub(crate) fn v_bool(v: &Value, key: &str) -> Option<bool> {
    v.get(key).and_then(|x| x.as_bool())
}

/// Epoch-seconds field (Etsy timestamps).
pub(crate) fn v_epoch(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    let secs = v_i64(v, key)?;
    Utc.timestamp_opt(secs, 0).single()
}

/// RFC3339 string field (Shopify timestamps).
pub(crate) fn v_rfc3339(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    v_str(v, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Etsy money object `{amount, divisor, currency_code}` → minor units.
pub(crate) fn etsy_money_minor(v: &Value) -> Option<(i64, String)> {
    let amount = v.get("amount")?.as_i64()?;
    let divisor = v.get("divisor")?.as_i64()?;
    if divisor <= 0 {
        return None;
    }
    let currency = v.get("currency_code")?.as_str()?.to_string();
    // amount/divisor is the decimal value; minor units are cents.
    Some(((amount as f64 / divisor as f64 * 100.0).round() as i64, currency))
}

/// Decimal string (`"59.99"`) → minor units.
pub(crate) fn decimal_minor(s: &str) -> Option<i64> {
    let x: f64 = s.trim().parse().ok()?;
    Some((x * 100.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn etsy_money_handles_divisors() {
        let v = json!({"amount": 1234, "divisor": 100, "currency_code": "USD"});
        assert_eq!(etsy_money_minor(&v), Some((1234, "USD".to_string())));
        let v = json!({"amount": 15, "divisor": 1, "currency_code": "EUR"});
        assert_eq!(etsy_money_minor(&v), Some((1500, "EUR".to_string())));
        let v = json!({"amount": 15, "divisor": 0, "currency_code": "EUR"});
        assert_eq!(etsy_money_minor(&v), None);
    }

    #[test]
    fn decimal_strings_round_to_cents() {
        assert_eq!(decimal_minor("59.99"), Some(5999));
        assert_eq!(decimal_minor("0.1"), Some(10));
        assert_eq!(decimal_minor("garbage"), None);
    }

    #[test]
    fn timestamps_parse_both_shapes() {
        let v = json!({"created": 1700000000});
        assert!(v_epoch(&v, "created").is_some());
        let v = json!({"created_at": "2024-05-01T10:00:00-04:00"});
        let dt = v_rfc3339(&v, "created_at").unwrap();
        assert_eq!(dt.timezone(), Utc);
    }
}
