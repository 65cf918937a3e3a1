use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::fmt;

use super::decimal_value;
use crate::domain::{Barriers, ConnectionState, OrderSpec};
use crate::error::{DerivError, Result};

/// Logical request kinds understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Authorize,
    Balance,
    ActiveSymbols,
    ContractsFor,
    Ticks,
    Forget,
    ForgetAll,
    Proposal,
    Buy,
    ProposalOpenContract,
    ContractUpdate,
    Sell,
    Portfolio,
    Ping,
}

impl RequestKind {
    /// Operation key of the outbound object
    pub fn op_key(&self) -> &'static str {
        match self {
            RequestKind::Authorize => "authorize",
            RequestKind::Balance => "balance",
            RequestKind::ActiveSymbols => "active_symbols",
            RequestKind::ContractsFor => "contracts_for",
            RequestKind::Ticks => "ticks",
            RequestKind::Forget => "forget",
            RequestKind::ForgetAll => "forget_all",
            RequestKind::Proposal => "proposal",
            RequestKind::Buy => "buy",
            RequestKind::ProposalOpenContract => "proposal_open_contract",
            RequestKind::ContractUpdate => "contract_update",
            RequestKind::Sell => "sell",
            RequestKind::Portfolio => "portfolio",
            RequestKind::Ping => "ping",
        }
    }

    /// `msg_type` the matching response must carry
    pub fn response_msg_type(&self) -> &'static str {
        match self {
            RequestKind::Ticks => "tick",
            other => other.op_key(),
        }
    }

    /// Whether a request of this kind may be sent in `state`
    pub fn permitted_in(&self, state: ConnectionState) -> bool {
        match self {
            RequestKind::Authorize => matches!(
                state,
                ConnectionState::Connected | ConnectionState::Authenticating
            ),
            _ => state == ConnectionState::Ready,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op_key())
    }
}

/// An outbound request before a correlation id is attached
#[derive(Debug, Clone)]
pub struct Request {
    kind: RequestKind,
    payload: Map<String, Value>,
}

impl Request {
    fn new(kind: RequestKind, value: Value) -> Self {
        let mut payload = Map::new();
        payload.insert(kind.op_key().to_string(), value);
        Self { kind, payload }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Request asks the server to keep streaming
    pub fn subscribes(&self) -> bool {
        self.payload
            .get("subscribe")
            .and_then(Value::as_i64)
            .map(|v| v == 1)
            .unwrap_or(false)
    }

    /// Serialize with `req_id` attached
    pub fn encode(&self, req_id: u64) -> Result<String> {
        let mut frame = self.payload.clone();
        frame.insert("req_id".to_string(), json!(req_id));
        Ok(serde_json::to_string(&Value::Object(frame))?)
    }

    pub fn authorize(token: &str) -> Self {
        Self::new(RequestKind::Authorize, json!(token))
    }

    pub fn balance() -> Self {
        Self::new(RequestKind::Balance, json!(1))
    }

    pub fn active_symbols() -> Self {
        Self::new(RequestKind::ActiveSymbols, json!("brief"))
    }

    pub fn contracts_for(symbol: &str) -> Self {
        Self::new(RequestKind::ContractsFor, json!(symbol))
    }

    pub fn ticks(symbol: &str, subscribe: bool) -> Self {
        let request = Self::new(RequestKind::Ticks, json!(symbol));
        if subscribe {
            request.with("subscribe", json!(1))
        } else {
            request
        }
    }

    /// Cancel one stream by its server subscription id
    pub fn forget(stream_id: &str) -> Self {
        Self::new(RequestKind::Forget, json!(stream_id))
    }

    /// Cancel every stream of a channel, e.g. `"ticks"`
    pub fn forget_all(channel: &str) -> Self {
        Self::new(RequestKind::ForgetAll, json!(channel))
    }

    pub fn proposal(spec: &OrderSpec, currency: &str) -> Self {
        Self::new(RequestKind::Proposal, json!(1))
            .with("amount", decimal_value(spec.amount))
            .with("basis", json!("stake"))
            .with("contract_type", json!(spec.contract_type.as_str()))
            .with("currency", json!(currency))
            .with("duration", json!(spec.duration))
            .with("duration_unit", json!(spec.duration_unit.as_str()))
            .with("symbol", json!(spec.symbol))
    }

    /// Confirm a proposal, paying at most `max_price`
    pub fn buy(proposal_id: &str, max_price: Decimal) -> Self {
        Self::new(RequestKind::Buy, json!(proposal_id)).with("price", decimal_value(max_price))
    }

    pub fn proposal_open_contract(contract_id: &str) -> Result<Self> {
        Ok(Self::new(RequestKind::ProposalOpenContract, json!(1))
            .with("contract_id", contract_id_value(contract_id)?))
    }

    /// Apply take-profit / stop-loss levels to an open contract
    pub fn contract_update(contract_id: &str, barriers: &Barriers) -> Result<Self> {
        let mut limit_order = Map::new();
        if let Some(tp) = barriers.take_profit {
            limit_order.insert("take_profit".to_string(), decimal_value(tp));
        }
        if let Some(sl) = barriers.stop_loss {
            limit_order.insert("stop_loss".to_string(), decimal_value(sl));
        }
        if limit_order.is_empty() {
            return Err(DerivError::InvalidParameters(
                "contract update needs a take-profit or stop-loss".to_string(),
            ));
        }

        Ok(Self::new(RequestKind::ContractUpdate, json!(1))
            .with("contract_id", contract_id_value(contract_id)?)
            .with("limit_order", Value::Object(limit_order)))
    }

    /// Sell an open contract; price 0 sells at market
    pub fn sell(contract_id: &str, min_price: Decimal) -> Result<Self> {
        Ok(Self::new(RequestKind::Sell, contract_id_value(contract_id)?)
            .with("price", decimal_value(min_price)))
    }

    pub fn portfolio() -> Self {
        Self::new(RequestKind::Portfolio, json!(1))
    }

    pub fn ping() -> Self {
        Self::new(RequestKind::Ping, json!(1))
    }
}

/// Contract ids go out as integers when numeric, otherwise verbatim
fn contract_id_value(contract_id: &str) -> Result<Value> {
    let trimmed = contract_id.trim();
    if trimmed.is_empty() {
        return Err(DerivError::InvalidParameters(
            "contract id cannot be empty".to_string(),
        ));
    }
    Ok(trimmed
        .parse::<u64>()
        .map(|id| json!(id))
        .unwrap_or_else(|_| json!(trimmed)))
}
