//! Order lifecycle: quote, buy, modify, close and cancel.
//!
//! Each tracked contract moves through `Quoting -> Buying -> Open`, may
//! bounce through `Modifying`, and leaves via `Closing` or `Cancelling`
//! into `Settled`. Operations on one contract id are serialized by a
//! per-contract lock; different contracts proceed concurrently.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::catalog::MarketCatalog;
use crate::config::TradingConfig;
use crate::domain::{
    BarrierSide, BarrierSpec, Barriers, BuyReceipt, Contract, ContractState, ContractType,
    DurationUnit, OpenContractDetails, OrderSpec, PortfolioContract, Proposal, SaleReceipt,
};
use crate::error::{DerivError, Result};
use crate::protocol::Request;
use crate::session::RequestCorrelator;

/// Drives contracts through their lifecycle states
pub struct OrderLifecycleManager {
    correlator: Arc<RequestCorrelator>,
    catalog: Arc<MarketCatalog>,
    contracts: DashMap<String, Contract>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    currency: String,
    allowed_units: Vec<DurationUnit>,
}

impl OrderLifecycleManager {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        catalog: Arc<MarketCatalog>,
        config: &TradingConfig,
    ) -> Self {
        Self {
            correlator,
            catalog,
            contracts: DashMap::new(),
            locks: DashMap::new(),
            currency: config.currency.clone(),
            allowed_units: config.allowed_duration_units.clone(),
        }
    }

    /// Snapshot of one tracked contract
    pub fn contract(&self, contract_id: &str) -> Option<Contract> {
        self.contracts.get(contract_id).map(|c| c.clone())
    }

    /// Snapshot of every tracked contract
    pub fn contracts(&self) -> Vec<Contract> {
        let mut all: Vec<Contract> = self.contracts.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Contracts currently holding a serialization lock
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Only tracked contracts get a lock
    fn lock_for(&self, contract_id: &str) -> Result<Arc<Mutex<()>>> {
        if !self.contracts.contains_key(contract_id) {
            return Err(DerivError::ContractNotFound(contract_id.to_string()));
        }
        Ok(Arc::clone(
            self.locks
                .entry(contract_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        ))
    }

    /// Quote and buy a contract.
    ///
    /// The returned contract is `Open`. Take-profit / stop-loss levels in
    /// `spec` are applied afterwards; if that fails the contract stays
    /// open without them.
    pub async fn place_order(&self, spec: OrderSpec) -> Result<Contract> {
        spec.validate(&self.allowed_units)?;
        self.catalog.require_symbol(&spec.symbol).await?;

        let mut contract = Contract::from_spec(&spec);
        info!(
            symbol = %spec.symbol,
            amount = %spec.amount,
            contract_type = %spec.contract_type,
            duration = spec.duration,
            unit = %spec.duration_unit,
            "Requesting quote"
        );

        let proposal: Proposal = self
            .correlator
            .request(Request::proposal(&spec, &self.currency))
            .await
            .and_then(|r| r.parse("proposal"))
            .map_err(|e| market_error(e, &spec.symbol))?;
        debug!(proposal_id = %proposal.id, ask_price = %proposal.ask_price, "Quote received");

        contract.proposal_id = Some(proposal.id.clone());
        contract.transition(ContractState::Buying)?;

        let receipt: BuyReceipt = self
            .correlator
            .request(Request::buy(&proposal.id, spec.amount))
            .await
            .and_then(|r| r.parse("buy"))
            .map_err(|e| market_error(e, &spec.symbol))?;

        contract.mark_open(receipt.contract_id.clone(), Some(receipt.buy_price), receipt.payout)?;
        let contract_id = receipt.contract_id;
        self.contracts.insert(contract_id.clone(), contract.clone());
        info!(
            contract_id = %contract_id,
            buy_price = %receipt.buy_price,
            "Contract open"
        );

        if spec.take_profit.is_some() || spec.stop_loss.is_some() {
            match self
                .modify_order(&contract_id, spec.take_profit, spec.stop_loss)
                .await
            {
                Ok(updated) => contract = updated,
                Err(e) => warn!(contract_id = %contract_id, error = %e, "Limits not applied"),
            }
        }

        Ok(contract)
    }

    /// Apply take-profit / stop-loss levels to an open contract.
    ///
    /// Percentages resolve against the contract's current spot. The
    /// contract is back in `Open` whether or not the update succeeds.
    pub async fn modify_order(
        &self,
        contract_id: &str,
        take_profit: Option<BarrierSpec>,
        stop_loss: Option<BarrierSpec>,
    ) -> Result<Contract> {
        if take_profit.is_none() && stop_loss.is_none() {
            return Err(DerivError::InvalidParameters(
                "modify needs a take-profit or stop-loss".to_string(),
            ));
        }

        let lock = self.lock_for(contract_id)?;
        let _guard = lock.lock().await;

        let symbol = self.begin(contract_id, ContractState::Modifying)?;
        let outcome = self
            .update_limits(contract_id, &symbol, take_profit, stop_loss)
            .await;

        let mut entry = self
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| DerivError::ContractNotFound(contract_id.to_string()))?;
        entry.transition(ContractState::Open)?;

        match outcome {
            Ok(barriers) => {
                if barriers.take_profit.is_some() {
                    entry.barriers.take_profit = barriers.take_profit;
                    entry.take_profit = take_profit;
                }
                if barriers.stop_loss.is_some() {
                    entry.barriers.stop_loss = barriers.stop_loss;
                    entry.stop_loss = stop_loss;
                }
                info!(
                    contract_id,
                    take_profit = ?entry.barriers.take_profit,
                    stop_loss = ?entry.barriers.stop_loss,
                    "Contract limits updated"
                );
                Ok(entry.clone())
            }
            Err(e) => {
                warn!(contract_id, error = %e, "Contract update failed");
                Err(e)
            }
        }
    }

    async fn update_limits(
        &self,
        contract_id: &str,
        symbol: &str,
        take_profit: Option<BarrierSpec>,
        stop_loss: Option<BarrierSpec>,
    ) -> Result<Barriers> {
        let details: OpenContractDetails = self
            .correlator
            .request(Request::proposal_open_contract(contract_id)?)
            .await?
            .parse("proposal_open_contract")?;

        let spot = details.current_spot.ok_or_else(|| {
            DerivError::UnexpectedResponse(format!("contract {contract_id} has no current spot"))
        })?;
        let underlying = if details.underlying.is_empty() {
            symbol.to_string()
        } else {
            details.underlying
        };

        match self.catalog.symbol(&underlying, true).await? {
            Some(active) if active.is_tradable() => {}
            _ => return Err(DerivError::MarketClosed(underlying)),
        }

        let barriers = Barriers {
            take_profit: take_profit
                .map(|b| b.resolve(spot, BarrierSide::Above))
                .transpose()?,
            stop_loss: stop_loss
                .map(|b| b.resolve(spot, BarrierSide::Below))
                .transpose()?,
        };
        debug!(contract_id, %spot, ?barriers, "Resolved barriers");

        self.correlator
            .request(Request::contract_update(contract_id, &barriers)?)
            .await
            .map_err(|e| market_error(e, &underlying))?;
        Ok(barriers)
    }

    /// Sell an open contract at market
    pub async fn close_position(&self, contract_id: &str) -> Result<Contract> {
        self.settle(contract_id, ContractState::Closing).await
    }

    /// Cancel an open contract; settles the same way a close does
    pub async fn cancel_order(&self, contract_id: &str) -> Result<Contract> {
        self.settle(contract_id, ContractState::Cancelling).await
    }

    async fn settle(&self, contract_id: &str, via: ContractState) -> Result<Contract> {
        let request = Request::sell(contract_id, Decimal::ZERO)?;
        let lock = self.lock_for(contract_id)?;
        let _guard = lock.lock().await;

        let symbol = self.begin(contract_id, via)?;
        info!(contract_id, state = %via, "Selling contract");

        let outcome = self
            .correlator
            .request(request)
            .await
            .and_then(|r| r.parse::<SaleReceipt>("sell"));

        match outcome {
            Ok(receipt) => {
                let (_, mut contract) = self
                    .contracts
                    .remove(contract_id)
                    .ok_or_else(|| DerivError::ContractNotFound(contract_id.to_string()))?;
                contract.sold_for = Some(receipt.sold_for);
                contract.transition(ContractState::Settled)?;
                self.locks.remove(contract_id);
                info!(
                    contract_id,
                    sold_for = %receipt.sold_for,
                    pnl = ?contract.realized_pnl(),
                    "Contract settled"
                );
                Ok(contract)
            }
            Err(e) => {
                if let Some(mut entry) = self.contracts.get_mut(contract_id) {
                    entry.transition(ContractState::Open)?;
                }
                warn!(contract_id, error = %e, "Sell failed; contract stays open");
                Err(market_error(e, &symbol))
            }
        }
    }

    /// Require `Open` and move to `target`, returning the symbol
    fn begin(&self, contract_id: &str, target: ContractState) -> Result<String> {
        let Some(mut entry) = self.contracts.get_mut(contract_id) else {
            // Settled while this caller waited on the lock
            self.locks.remove(contract_id);
            return Err(DerivError::ContractNotFound(contract_id.to_string()));
        };
        entry.ensure_open()?;
        entry.transition(target)?;
        Ok(entry.symbol.clone())
    }

    /// Track open contracts reported by the account's portfolio.
    ///
    /// Returns the ids newly adopted. Contract types other than CALL and
    /// PUT are skipped.
    pub fn adopt(&self, open: &[PortfolioContract]) -> Vec<String> {
        let mut adopted = Vec::new();
        for item in open {
            if self.contracts.contains_key(&item.contract_id) {
                continue;
            }
            let contract_type = match item.contract_type.parse::<ContractType>() {
                Ok(t) => t,
                Err(_) => {
                    debug!(contract_id = %item.contract_id, contract_type = %item.contract_type, "Skipping unsupported contract");
                    continue;
                }
            };
            let contract = Contract::adopted(
                &item.contract_id,
                &item.symbol,
                contract_type,
                item.buy_price,
                item.payout,
            );
            self.contracts.insert(item.contract_id.clone(), contract);
            adopted.push(item.contract_id.clone());
        }
        if !adopted.is_empty() {
            info!(count = adopted.len(), "Adopted open contracts");
        }
        adopted
    }
}

/// Surface market-closed rejections as `MarketClosed`
fn market_error(error: DerivError, symbol: &str) -> DerivError {
    if error.is_market_closed() {
        DerivError::MarketClosed(symbol.to_string())
    } else {
        error
    }
}
