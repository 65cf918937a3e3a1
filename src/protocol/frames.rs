use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::RequestKind;
use crate::error::{DerivError, Result};

/// `error` object of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorBody {
    pub code: String,
    pub message: String,
}

/// Identity of a streaming feed: channel kind plus topic (usually a symbol)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub channel: String,
    pub topic: String,
}

impl SubscriptionKey {
    pub fn new(channel: &str, topic: &str) -> Self {
        Self {
            channel: channel.to_string(),
            topic: topic.to_string(),
        }
    }

    pub fn ticks(symbol: &str) -> Self {
        Self::new("ticks", symbol)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.topic)
    }
}

/// A parsed inbound frame, before routing
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub req_id: Option<u64>,
    pub msg_type: Option<String>,
    pub error: Option<ServerErrorBody>,
    /// Server-side stream id, present on streaming messages
    pub subscription_id: Option<String>,
    pub body: Value,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let body: Value = serde_json::from_str(text)?;
        if !body.is_object() {
            return Err(DerivError::UnexpectedResponse(format!(
                "frame is not an object: {}",
                preview(text)
            )));
        }
        Ok(Self::from_value(body))
    }

    pub fn from_value(body: Value) -> Self {
        let req_id = body.get("req_id").and_then(Value::as_u64);
        let msg_type = body
            .get("msg_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let error = body
            .get("error")
            .and_then(|e| serde_json::from_value::<ServerErrorBody>(e.clone()).ok());
        let subscription_id = body
            .get("subscription")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            req_id,
            msg_type,
            error,
            subscription_id,
            body,
        }
    }

    /// Feed this frame belongs to, derived from its shape
    pub fn stream_key(&self) -> Option<SubscriptionKey> {
        match self.msg_type.as_deref()? {
            "tick" => {
                let symbol = self.body.get("tick")?.get("symbol")?.as_str()?;
                Some(SubscriptionKey::ticks(symbol))
            }
            "proposal_open_contract" => {
                let id = self.body.get("proposal_open_contract")?.get("contract_id")?;
                let id = match id {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => return None,
                };
                Some(SubscriptionKey::new("proposal_open_contract", &id))
            }
            "balance" if self.subscription_id.is_some() => {
                Some(SubscriptionKey::new("balance", "account"))
            }
            _ => None,
        }
    }

    pub fn is_push(&self) -> bool {
        self.subscription_id.is_some()
    }
}

/// A successful response matched to its request
#[derive(Debug, Clone)]
pub struct Response {
    pub req_id: u64,
    pub msg_type: String,
    pub body: Value,
}

impl Response {
    /// Payload under the operation key, e.g. `body["buy"]`
    pub fn payload(&self) -> Option<&Value> {
        self.body.get(&self.msg_type)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Deserialize the value under `key`
    pub fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self.body.get(key).ok_or_else(|| {
            DerivError::UnexpectedResponse(format!(
                "{} response (req_id {}) has no '{}' field",
                self.msg_type, self.req_id, key
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            DerivError::UnexpectedResponse(format!(
                "{} response field '{}' malformed: {}",
                self.msg_type, key, e
            ))
        })
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.body
            .get("subscription")
            .and_then(|s| s.get("id"))
            .and_then(Value::as_str)
    }

    /// Check the response answers the expected kind
    pub(crate) fn expect_kind(self, kind: RequestKind) -> Result<Self> {
        if self.msg_type == kind.response_msg_type() {
            Ok(self)
        } else {
            Err(DerivError::UnexpectedResponse(format!(
                "req_id {} expected '{}' but got '{}'",
                self.req_id,
                kind.response_msg_type(),
                self.msg_type
            )))
        }
    }
}

pub(crate) fn preview(text: &str) -> &str {
    let mut end = text.len().min(200);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
