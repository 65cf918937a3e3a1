//! In-memory transport for tests and dry runs.
//!
//! [`MockTransport`] records every outbound frame and hands each one to an
//! optional responder whose replies are fed back as inbound frames.
//! [`ScriptedBroker`] is a responder that answers the Deriv protocol well
//! enough to drive a full trading session.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use super::{FrameSink, Transport, TransportEvent, TransportLink};
use crate::error::{DerivError, Result};
use crate::protocol::{decimal_value, value_decimal};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Produces inbound replies for one outbound request
pub type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

#[derive(Default)]
struct MockInner {
    sent: Mutex<Vec<Value>>,
    responder: Mutex<Option<Responder>>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_sends: AtomicBool,
}

impl MockInner {
    fn emit(&self, event: TransportEvent) -> bool {
        let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }
}

/// Transport that never touches the network
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every outbound frame through `responder`
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        let transport = Self::new();
        transport.set_responder(responder);
        transport
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Value) -> Vec<Value> + Send + 'static,
    {
        *self.inner.responder.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(responder));
    }

    /// Every frame sent so far, oldest first
    pub fn sent(&self) -> Vec<Value> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Sent frames whose operation key is `op`
    pub fn sent_op(&self, op: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|frame| frame.get(op).is_some())
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Deliver an inbound frame on the current link
    pub fn inject(&self, frame: Value) -> bool {
        self.inner.emit(TransportEvent::Frame(frame.to_string()))
    }

    /// Deliver raw text, e.g. malformed frames
    pub fn inject_text(&self, text: &str) -> bool {
        self.inner.emit(TransportEvent::Frame(text.to_string()))
    }

    /// Simulate the peer dropping the link
    pub fn drop_link(&self, reason: &str) -> bool {
        let delivered = self
            .inner
            .emit(TransportEvent::Closed(Some(reason.to_string())));
        *self.inner.events.lock().unwrap_or_else(|e| e.into_inner()) = None;
        delivered
    }

    /// Simulate a transport error on the current link
    pub fn fail_link(&self, message: &str) -> bool {
        let delivered = self.inner.emit(TransportEvent::Error(message.to_string()));
        *self.inner.events.lock().unwrap_or_else(|e| e.into_inner()) = None;
        delivered
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make every send fail until reset
    pub fn fail_sends(&self, failing: bool) {
        self.inner.failing_sends.store(failing, Ordering::SeqCst);
    }

    /// Successful and failed opens so far
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &Url) -> Result<TransportLink> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let failing = self.inner.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(DerivError::Connection(format!("mock open of {url} refused")));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.inner.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events_tx);

        Ok(TransportLink {
            sink: Arc::new(MockSink {
                inner: Arc::clone(&self.inner),
            }),
            events: events_rx,
        })
    }
}

struct MockSink {
    inner: Arc<MockInner>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&self, frame: String) -> Result<()> {
        if self.inner.failing_sends.load(Ordering::SeqCst) {
            return Err(DerivError::Connection("mock send failed".to_string()));
        }
        if self.inner.events.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return Err(DerivError::Connection("mock link is closed".to_string()));
        }

        let request: Value = serde_json::from_str(&frame)?;
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let replies = {
            let mut responder = self
                .inner
                .responder
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match responder.as_mut() {
                Some(respond) => respond(&request),
                None => Vec::new(),
            }
        };

        for reply in replies {
            if !self.inner.emit(TransportEvent::Frame(reply.to_string())) {
                debug!("Mock link gone; dropping scripted reply");
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.emit(TransportEvent::Closed(Some("client close".to_string())));
        *self.inner.events.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct QuotedProposal {
    symbol: String,
    contract_type: String,
    amount: Decimal,
}

#[derive(Debug, Clone)]
struct BoughtContract {
    symbol: String,
    contract_type: String,
    buy_price: Decimal,
    payout: Decimal,
}

#[derive(Debug)]
struct BrokerState {
    token: String,
    symbols: Vec<Value>,
    spot: Decimal,
    next_proposal: u64,
    next_contract: u64,
    next_stream: u64,
    next_transaction: u64,
    proposals: HashMap<String, QuotedProposal>,
    contracts: HashMap<String, BoughtContract>,
    /// symbol -> (stream id, subscribing req_id)
    streams: HashMap<String, (String, u64)>,
    silent: HashSet<String>,
    failures: HashMap<String, (String, String)>,
    limit_orders: Vec<Value>,
}

/// Scripted Deriv server for the mock transport.
///
/// Clones share state, so a test can keep one handle to steer the broker
/// (move spot, close a market, fail an operation) while another clone
/// answers frames inside the transport.
#[derive(Debug, Clone)]
pub struct ScriptedBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ScriptedBroker {
    /// Broker accepting `token`, listing R_100 (open) and OTC_SPC (closed)
    pub fn new(token: &str) -> Self {
        let symbols = vec![
            symbol_entry("R_100", "Volatility 100 Index", "synthetic_index", "random_index", true),
            symbol_entry("OTC_SPC", "US 500", "indices", "americas_OTC", false),
        ];

        Self {
            state: Arc::new(Mutex::new(BrokerState {
                token: token.to_string(),
                symbols,
                spot: dec!(140),
                next_proposal: 1,
                next_contract: 1,
                next_stream: 1,
                next_transaction: 5000,
                proposals: HashMap::new(),
                contracts: HashMap::new(),
                streams: HashMap::new(),
                silent: HashSet::new(),
                failures: HashMap::new(),
                limit_orders: Vec::new(),
            })),
        }
    }

    /// Mock transport wired to a clone of this broker
    pub fn transport(&self) -> MockTransport {
        let broker = self.clone();
        MockTransport::with_responder(move |request| broker.respond(request))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_spot(&self, spot: Decimal) {
        self.lock().spot = spot;
    }

    /// Open or close trading on a listed symbol
    pub fn set_market_open(&self, symbol: &str, open: bool) {
        let mut state = self.lock();
        for entry in state.symbols.iter_mut() {
            if entry["symbol"] == symbol {
                entry["exchange_is_open"] = json!(if open { 1 } else { 0 });
            }
        }
    }

    /// Never answer requests with operation key `op`
    pub fn silence(&self, op: &str) {
        self.lock().silent.insert(op.to_string());
    }

    pub fn unsilence(&self, op: &str) {
        self.lock().silent.remove(op);
    }

    /// Answer `op` with a structured error until cleared
    pub fn fail_op(&self, op: &str, code: &str, message: &str) {
        self.lock()
            .failures
            .insert(op.to_string(), (code.to_string(), message.to_string()));
    }

    pub fn clear_failure(&self, op: &str) {
        self.lock().failures.remove(op);
    }

    /// Seed an open contract as if bought in an earlier session
    pub fn seed_contract(&self, contract_id: &str, symbol: &str, contract_type: &str, buy_price: Decimal) {
        self.lock().contracts.insert(
            contract_id.to_string(),
            BoughtContract {
                symbol: symbol.to_string(),
                contract_type: contract_type.to_string(),
                buy_price,
                payout: buy_price * dec!(1.95),
            },
        );
    }

    /// Contracts currently open on the broker
    pub fn open_contracts(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().contracts.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `limit_order` objects received by `contract_update`, in order
    pub fn limit_orders(&self) -> Vec<Value> {
        self.lock().limit_orders.clone()
    }

    /// Streaming tick for a subscribed symbol, or `None` when not streaming
    pub fn tick_push(&self, symbol: &str, quote: Decimal) -> Option<Value> {
        let mut state = self.lock();
        let (stream_id, req_id) = state.streams.get(symbol).cloned()?;
        state.spot = quote;
        Some(json!({
            "msg_type": "tick",
            "req_id": req_id,
            "echo_req": {"ticks": symbol, "subscribe": 1},
            "subscription": {"id": stream_id},
            "tick": tick_body(symbol, quote, &stream_id),
        }))
    }

    /// Reply frames for one request
    pub fn respond(&self, request: &Value) -> Vec<Value> {
        let Some(op) = operation_of(request) else {
            return Vec::new();
        };
        let req_id = request.get("req_id").cloned().unwrap_or(Value::Null);
        let mut state = self.lock();

        if state.silent.contains(&op) {
            return Vec::new();
        }

        let msg_type = if op == "ticks" { "tick".to_string() } else { op.clone() };
        let reply = |payload: Outcome| {
            let mut frame = Map::new();
            frame.insert("echo_req".to_string(), request.clone());
            frame.insert("msg_type".to_string(), json!(msg_type));
            if !req_id.is_null() {
                frame.insert("req_id".to_string(), req_id.clone());
            }
            match payload {
                Ok(fields) => frame.extend(fields),
                Err((code, message)) => {
                    frame.insert("error".to_string(), json!({"code": code, "message": message}));
                }
            }
            Value::Object(frame)
        };

        if let Some(failure) = state.failures.get(&op).cloned() {
            return vec![reply(Err(failure))];
        }

        let outcome = match op.as_str() {
            "authorize" => state.authorize(request),
            "balance" => Ok(single(
                "balance",
                json!({"balance": 10000, "currency": "USD", "loginid": "CR900000"}),
            )),
            "active_symbols" => Ok(single("active_symbols", Value::Array(state.symbols.clone()))),
            "contracts_for" => state.contracts_for(request),
            "ticks" => state.ticks(request),
            "forget" => {
                let id = request["forget"].as_str().unwrap_or_default().to_string();
                let before = state.streams.len();
                state.streams.retain(|_, (stream, _)| *stream != id);
                Ok(single("forget", json!(if state.streams.len() < before { 1 } else { 0 })))
            }
            "forget_all" => {
                let ids: Vec<Value> = state.streams.drain().map(|(_, (id, _))| json!(id)).collect();
                Ok(single("forget_all", Value::Array(ids)))
            }
            "proposal" => state.proposal(request),
            "buy" => state.buy(request),
            "proposal_open_contract" => state.open_contract(request),
            "contract_update" => state.contract_update(request),
            "sell" => state.sell(request),
            "portfolio" => Ok(single("portfolio", json!({"contracts": state.portfolio()}))),
            "ping" => Ok(single("ping", json!("pong"))),
            other => Err(("UnrecognisedRequest".to_string(), format!("Unrecognised request: {other}"))),
        };

        vec![reply(outcome)]
    }
}

type Outcome = std::result::Result<Map<String, Value>, (String, String)>;

impl BrokerState {
    fn authorize(&self, request: &Value) -> Outcome {
        if request["authorize"].as_str() != Some(self.token.as_str()) {
            return Err(("InvalidToken".to_string(), "The token is invalid.".to_string()));
        }
        Ok(single(
            "authorize",
            json!({"loginid": "CR900000", "currency": "USD", "balance": 10000, "fullname": "Mr Test"}),
        ))
    }

    fn listed(&self, symbol: &str) -> Option<&Value> {
        self.symbols.iter().find(|s| s["symbol"] == symbol)
    }

    fn is_open(&self, symbol: &str) -> bool {
        self.listed(symbol)
            .map(|s| s["exchange_is_open"] == json!(1))
            .unwrap_or(false)
    }

    fn contracts_for(&self, request: &Value) -> Outcome {
        let symbol = request["contracts_for"].as_str().unwrap_or_default();
        if self.listed(symbol).is_none() {
            return Err(("InvalidSymbol".to_string(), format!("Symbol {symbol} is invalid.")));
        }
        Ok(single(
            "contracts_for",
            json!({"available": [
                {"contract_type": "CALL", "min_contract_duration": "1d", "max_contract_duration": "365d", "barrier_category": "euro_atm"},
                {"contract_type": "PUT", "min_contract_duration": "1d", "max_contract_duration": "365d", "barrier_category": "euro_atm"}
            ]}),
        ))
    }

    fn ticks(&mut self, request: &Value) -> Outcome {
        let symbol = request["ticks"].as_str().unwrap_or_default().to_string();
        if self.listed(&symbol).is_none() {
            return Err(("InvalidSymbol".to_string(), format!("Symbol {symbol} is invalid.")));
        }

        let stream_id = format!("stream-{}", self.next_stream);
        let mut fields = single("tick", tick_body(&symbol, self.spot, &stream_id));
        if request["subscribe"] == json!(1) {
            self.next_stream += 1;
            let req_id = request["req_id"].as_u64().unwrap_or_default();
            self.streams.insert(symbol, (stream_id.clone(), req_id));
            fields.insert("subscription".to_string(), json!({"id": stream_id}));
        }
        Ok(fields)
    }

    fn proposal(&mut self, request: &Value) -> Outcome {
        let symbol = request["symbol"].as_str().unwrap_or_default().to_string();
        if self.listed(&symbol).is_none() {
            return Err(("InvalidSymbol".to_string(), format!("Symbol {symbol} is invalid.")));
        }
        let amount = value_decimal(&request["amount"]).unwrap_or_default();
        let id = format!("Q{}", self.next_proposal);
        self.next_proposal += 1;

        self.proposals.insert(
            id.clone(),
            QuotedProposal {
                symbol: symbol.clone(),
                contract_type: request["contract_type"].as_str().unwrap_or("CALL").to_string(),
                amount,
            },
        );

        Ok(single(
            "proposal",
            json!({
                "id": id,
                "ask_price": decimal_value(amount),
                "payout": decimal_value(amount * dec!(1.95)),
                "spot": decimal_value(self.spot),
                "longcode": format!("Win payout if {symbol} moves as predicted."),
            }),
        ))
    }

    fn buy(&mut self, request: &Value) -> Outcome {
        let proposal_id = request["buy"].as_str().unwrap_or_default();
        let Some(quote) = self.proposals.remove(proposal_id) else {
            return Err((
                "InvalidContractProposal".to_string(),
                "Price has moved or the proposal expired.".to_string(),
            ));
        };
        if !self.is_open(&quote.symbol) {
            return Err((
                "MarketIsClosed".to_string(),
                "This market is presently closed.".to_string(),
            ));
        }

        let contract_id = format!("C{}", self.next_contract);
        self.next_contract += 1;
        self.next_transaction += 1;
        let payout = quote.amount * dec!(1.95);
        self.contracts.insert(
            contract_id.clone(),
            BoughtContract {
                symbol: quote.symbol,
                contract_type: quote.contract_type,
                buy_price: quote.amount,
                payout,
            },
        );

        Ok(single(
            "buy",
            json!({
                "contract_id": contract_id,
                "buy_price": decimal_value(quote.amount),
                "payout": decimal_value(payout),
                "transaction_id": self.next_transaction,
                "longcode": "Scripted contract",
            }),
        ))
    }

    fn contract_key(request: &Value, field: &str) -> String {
        match &request[field] {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => String::new(),
        }
    }

    fn open_contract(&self, request: &Value) -> Outcome {
        let id = Self::contract_key(request, "contract_id");
        let Some(contract) = self.contracts.get(&id) else {
            return Err(("ContractNotFound".to_string(), format!("Contract {id} not found.")));
        };
        Ok(single(
            "proposal_open_contract",
            json!({
                "contract_id": id,
                "underlying": contract.symbol,
                "contract_type": contract.contract_type,
                "current_spot": decimal_value(self.spot),
                "buy_price": decimal_value(contract.buy_price),
                "bid_price": decimal_value(contract.buy_price),
                "is_valid_to_sell": 1,
                "status": "open",
            }),
        ))
    }

    fn contract_update(&mut self, request: &Value) -> Outcome {
        let id = Self::contract_key(request, "contract_id");
        if !self.contracts.contains_key(&id) {
            return Err(("ContractNotFound".to_string(), format!("Contract {id} not found.")));
        }
        let limit_order = request["limit_order"].clone();
        self.limit_orders.push(limit_order.clone());

        let mut echoed = Map::new();
        for key in ["take_profit", "stop_loss"] {
            if let Some(level) = limit_order.get(key) {
                echoed.insert(
                    key.to_string(),
                    json!({"order_amount": level, "display_name": key}),
                );
            }
        }
        Ok(single("contract_update", Value::Object(echoed)))
    }

    fn sell(&mut self, request: &Value) -> Outcome {
        let id = Self::contract_key(request, "sell");
        let Some(contract) = self.contracts.remove(&id) else {
            return Err((
                "InvalidSellContractProposal".to_string(),
                "This contract cannot be sold.".to_string(),
            ));
        };
        self.next_transaction += 1;
        Ok(single(
            "sell",
            json!({
                "contract_id": id,
                "sold_for": decimal_value(contract.buy_price * dec!(0.9)),
                "transaction_id": self.next_transaction,
            }),
        ))
    }

    fn portfolio(&self) -> Vec<Value> {
        let mut ids: Vec<&String> = self.contracts.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let contract = &self.contracts[id];
                json!({
                    "contract_id": id,
                    "symbol": contract.symbol,
                    "contract_type": contract.contract_type,
                    "buy_price": decimal_value(contract.buy_price),
                    "payout": decimal_value(contract.payout),
                    "currency": "USD",
                })
            })
            .collect()
    }
}

fn operation_of(request: &Value) -> Option<String> {
    const OPS: &[&str] = &[
        "authorize",
        "balance",
        "active_symbols",
        "contracts_for",
        "ticks",
        "forget_all",
        "forget",
        "proposal_open_contract",
        "proposal",
        "buy",
        "contract_update",
        "sell",
        "portfolio",
        "ping",
    ];
    let object = request.as_object()?;
    OPS.iter()
        .find(|op| object.contains_key(**op))
        .map(|op| op.to_string())
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

fn tick_body(symbol: &str, quote: Decimal, stream_id: &str) -> Value {
    json!({
        "symbol": symbol,
        "quote": decimal_value(quote),
        "bid": decimal_value(quote - dec!(0.01)),
        "ask": decimal_value(quote + dec!(0.01)),
        "epoch": 1_700_000_000,
        "id": stream_id,
    })
}

fn symbol_entry(symbol: &str, display: &str, market: &str, submarket: &str, open: bool) -> Value {
    json!({
        "symbol": symbol,
        "display_name": display,
        "market": market,
        "submarket": submarket,
        "exchange_is_open": if open { 1 } else { 0 },
        "is_trading_suspended": 0,
    })
}
