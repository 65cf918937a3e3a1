//! Deriv WebSocket wire format
//!
//! Requests are JSON objects whose operation key names the call
//! (`{"buy": "<proposal id>", "price": 8.5}`), plus an integer `req_id`
//! the server echoes back. Responses repeat the operation in `msg_type`
//! and carry either the result under that key or an `error` object.
//! Streaming messages additionally carry `subscription: {"id": ...}`.

pub mod frames;
pub mod request;

pub use frames::{InboundFrame, Response, ServerErrorBody, SubscriptionKey};
pub use request::{Request, RequestKind};

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Decimal as a JSON number without going through f64
pub fn decimal_value(value: Decimal) -> Value {
    serde_json::Number::from_str(&value.normalize().to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(value.to_string()))
}

/// Decimal from a JSON number or numeric string
pub fn value_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
