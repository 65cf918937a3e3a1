//! Short-lived cache of active symbols and contract offers.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{ActiveSymbol, ContractOffer};
use crate::error::{DerivError, Result};
use crate::protocol::Request;
use crate::session::RequestCorrelator;

#[derive(Clone)]
struct Cached<T> {
    fetched_at: Instant,
    value: Arc<T>,
}

impl<T> Cached<T> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Market listings fetched on demand and reused for `ttl`
pub struct MarketCatalog {
    correlator: Arc<RequestCorrelator>,
    ttl: Duration,
    symbols: RwLock<Option<Cached<Vec<ActiveSymbol>>>>,
    offers: DashMap<String, Cached<Vec<ContractOffer>>>,
}

impl MarketCatalog {
    pub fn new(correlator: Arc<RequestCorrelator>, ttl: Duration) -> Self {
        Self {
            correlator,
            ttl,
            symbols: RwLock::new(None),
            offers: DashMap::new(),
        }
    }

    /// Active symbols, from cache unless stale or `refresh` is set
    pub async fn active_symbols(&self, refresh: bool) -> Result<Arc<Vec<ActiveSymbol>>> {
        if !refresh {
            if let Some(cached) = self.symbols.read().await.as_ref() {
                if cached.is_fresh(self.ttl) {
                    return Ok(Arc::clone(&cached.value));
                }
            }
        }

        let response = self.correlator.request(Request::active_symbols()).await?;
        let symbols: Vec<ActiveSymbol> = response.parse("active_symbols")?;
        debug!(count = symbols.len(), "Fetched active symbols");

        let value = Arc::new(symbols);
        *self.symbols.write().await = Some(Cached {
            fetched_at: Instant::now(),
            value: Arc::clone(&value),
        });
        Ok(value)
    }

    /// Look up one symbol in the active set
    pub async fn symbol(&self, symbol: &str, refresh: bool) -> Result<Option<ActiveSymbol>> {
        let symbols = self.active_symbols(refresh).await?;
        Ok(symbols.iter().find(|s| s.symbol == symbol).cloned())
    }

    /// Like [`symbol`](Self::symbol) but absent symbols are an error
    pub async fn require_symbol(&self, symbol: &str) -> Result<ActiveSymbol> {
        self.symbol(symbol, false)
            .await?
            .ok_or_else(|| DerivError::InvalidSymbol(symbol.to_string()))
    }

    /// Contract offers for `symbol`
    pub async fn contracts_for(&self, symbol: &str) -> Result<Arc<Vec<ContractOffer>>> {
        if let Some(cached) = self.offers.get(symbol) {
            if cached.is_fresh(self.ttl) {
                return Ok(Arc::clone(&cached.value));
            }
        }

        let response = self.correlator.request(Request::contracts_for(symbol)).await?;
        let offers: Vec<ContractOffer> = response
            .payload()
            .and_then(|p| p.get("available"))
            .map(|available| serde_json::from_value(available.clone()))
            .transpose()?
            .unwrap_or_default();
        debug!(symbol, count = offers.len(), "Fetched contract offers");

        let value = Arc::new(offers);
        self.offers.insert(
            symbol.to_string(),
            Cached {
                fetched_at: Instant::now(),
                value: Arc::clone(&value),
            },
        );
        Ok(value)
    }

    /// Forget everything cached
    pub async fn invalidate(&self) {
        *self.symbols.write().await = None;
        self.offers.clear();
    }
}
