//! Caller-facing facade over the connection, session and trading layers.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::connection::{ConnectionLink, ConnectionManager};
use crate::domain::{
    sorted_trade_types, ActiveSymbol, Authorization, Balance, BarrierSpec, ConnectionState,
    Contract, ContractOffer, OrderSpec, PortfolioContract, Tick, TradeType,
};
use crate::error::{DerivError, Result};
use crate::protocol::{Request, SubscriptionKey};
use crate::session::{RequestCorrelator, SubscriptionHandle};
use crate::trading::{CommandParams, MarketCatalog, OrderLifecycleManager, TradeCommand};
use crate::transport::{Transport, WebSocketTransport};

const TICKS_CHANNEL: &str = "ticks";

/// Result of [`DerivClient::process_command`]
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Opened(Contract),
    Cancelled(Contract),
    Unsubscribed(Vec<SubscriptionKey>),
}

/// One logical session with the broker
pub struct DerivClient {
    config: AppConfig,
    manager: Arc<ConnectionManager>,
    correlator: Arc<RequestCorrelator>,
    catalog: Arc<MarketCatalog>,
    orders: OrderLifecycleManager,
}

impl DerivClient {
    /// Client speaking WebSocket to the configured endpoint
    pub fn new(config: AppConfig) -> Self {
        let transport = Arc::new(WebSocketTransport::new(config.connection.connect_timeout()));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        let link = Arc::new(ConnectionLink::new());
        let correlator = Arc::new(RequestCorrelator::new(link, &config.session));
        let manager = ConnectionManager::new(
            config.connection.clone(),
            transport,
            Arc::clone(&correlator),
        );
        let catalog = Arc::new(MarketCatalog::new(
            Arc::clone(&correlator),
            config.trading.symbol_cache_ttl(),
        ));
        let orders =
            OrderLifecycleManager::new(Arc::clone(&correlator), Arc::clone(&catalog), &config.trading);

        Self {
            config,
            manager,
            correlator,
            catalog,
            orders,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.link().watch_state()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    pub fn orders(&self) -> &OrderLifecycleManager {
        &self.orders
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Authorize with `token`, or the configured API token when `None`
    pub async fn authorize(&self, token: Option<&str>) -> Result<Authorization> {
        let token = match token {
            Some(token) => token.to_string(),
            None => self.config.connection.api_token.clone().ok_or_else(|| {
                DerivError::InvalidParameters("no API token configured".to_string())
            })?,
        };
        let authorization = self.manager.authenticate(&token).await?;
        info!(loginid = %authorization.loginid, currency = %authorization.currency, "Authorized");
        Ok(authorization)
    }

    /// Connect and authorize with the configured token
    pub async fn start(&self) -> Result<Authorization> {
        self.connect().await?;
        self.authorize(None).await
    }

    pub async fn fetch_balance(&self) -> Result<Balance> {
        self.correlator.request(Request::balance()).await?.parse("balance")
    }

    pub async fn fetch_active_symbols(&self) -> Result<Vec<ActiveSymbol>> {
        let symbols = self.catalog.active_symbols(false).await?;
        Ok(symbols.as_ref().clone())
    }

    /// Tradable symbols ordered by market, submarket and display name
    pub async fn fetch_trade_types(&self) -> Result<Vec<TradeType>> {
        let symbols = self.catalog.active_symbols(false).await?;
        Ok(sorted_trade_types(&symbols))
    }

    pub async fn fetch_contracts_for(&self, symbol: &str) -> Result<Vec<ContractOffer>> {
        let offers = self.catalog.contracts_for(symbol).await?;
        Ok(offers.as_ref().clone())
    }

    /// Stream ticks for `symbol`; repeated calls share one server stream
    pub async fn subscribe_ticks(&self, symbol: &str) -> Result<SubscriptionHandle> {
        self.correlator
            .subscribe(SubscriptionKey::ticks(symbol), Request::ticks(symbol, true))
            .await
    }

    pub async fn unsubscribe_ticks(&self, symbol: &str) -> Result<bool> {
        self.correlator
            .unsubscribe(&SubscriptionKey::ticks(symbol))
            .await
    }

    pub async fn unsubscribe_all_ticks(&self) -> Result<Vec<SubscriptionKey>> {
        self.correlator.unsubscribe_channel(TICKS_CHANNEL).await
    }

    /// Latest price for `symbol`.
    ///
    /// Reads the live stream when one exists, otherwise asks once.
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Tick> {
        let key = SubscriptionKey::ticks(symbol);
        if let Some(tick) = self
            .correlator
            .registry()
            .last_value(&key)
            .and_then(|body| body.get("tick").cloned())
        {
            return Ok(serde_json::from_value(tick)?);
        }

        self.correlator
            .request(Request::ticks(symbol, false))
            .await?
            .parse("tick")
    }

    pub async fn place_order(&self, spec: OrderSpec) -> Result<Contract> {
        self.orders.place_order(spec).await
    }

    /// Set take-profit / stop-loss, each either a price or a percentage like `"15%"`
    pub async fn modify_order(
        &self,
        contract_id: &str,
        take_profit: Option<&str>,
        stop_loss: Option<&str>,
    ) -> Result<Contract> {
        let take_profit = take_profit.map(str::parse::<BarrierSpec>).transpose()?;
        let stop_loss = stop_loss.map(str::parse::<BarrierSpec>).transpose()?;
        self.orders
            .modify_order(contract_id, take_profit, stop_loss)
            .await
    }

    pub async fn close_position(&self, contract_id: &str) -> Result<Contract> {
        self.orders.close_position(contract_id).await
    }

    pub async fn cancel_order(&self, contract_id: &str) -> Result<Contract> {
        self.orders.cancel_order(contract_id).await
    }

    pub async fn fetch_portfolio(&self) -> Result<Vec<PortfolioContract>> {
        let response = self.correlator.request(Request::portfolio()).await?;
        let contracts = response
            .payload()
            .and_then(|p| p.get("contracts"))
            .map(|c| serde_json::from_value(c.clone()))
            .transpose()?
            .unwrap_or_default();
        Ok(contracts)
    }

    /// Track the account's open contracts so they can be modified or closed
    pub async fn sync_portfolio(&self) -> Result<Vec<String>> {
        let open = self.fetch_portfolio().await?;
        Ok(self.orders.adopt(&open))
    }

    /// Run a text trading command such as `buy R_100`
    pub async fn process_command(
        &self,
        command: &str,
        params: &CommandParams,
    ) -> Result<CommandOutcome> {
        match TradeCommand::parse(command, params)? {
            TradeCommand::Open(spec) => self.place_order(spec).await.map(CommandOutcome::Opened),
            TradeCommand::Cancel { contract_id } => self
                .cancel_order(&contract_id)
                .await
                .map(CommandOutcome::Cancelled),
            TradeCommand::Unsubscribe => self
                .unsubscribe_all_ticks()
                .await
                .map(CommandOutcome::Unsubscribed),
        }
    }

    /// Drop every stream and close the connection
    pub async fn shutdown(&self) -> Result<()> {
        if self.state().is_ready() && !self.correlator.registry().is_empty() {
            if let Err(e) = self.unsubscribe_all_ticks().await {
                warn!(error = %e, "Could not unsubscribe before shutdown");
            }
        }
        self.manager.shutdown().await
    }
}
