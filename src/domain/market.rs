use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::de::{bool_from_int, opt_string_or_number, string_or_number};
use super::DurationUnit;

/// One entry of `active_symbols: "brief"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub submarket: String,
    #[serde(default, deserialize_with = "bool_from_int")]
    pub exchange_is_open: bool,
    #[serde(default, deserialize_with = "bool_from_int")]
    pub is_trading_suspended: bool,
}

impl ActiveSymbol {
    /// Open and not suspended
    pub fn is_tradable(&self) -> bool {
        self.exchange_is_open && !self.is_trading_suspended
    }
}

/// Symbol projection used for choosing what to trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeType {
    pub market: String,
    pub submarket: String,
    pub symbol: String,
    pub display_name: String,
}

impl TradeType {
    fn sort_key_cmp(&self, other: &Self) -> Ordering {
        self.market
            .cmp(&other.market)
            .then_with(|| self.submarket.cmp(&other.submarket))
            .then_with(|| self.display_name.cmp(&other.display_name))
    }
}

/// Trade types sorted by market, then submarket, then display name
pub fn sorted_trade_types(symbols: &[ActiveSymbol]) -> Vec<TradeType> {
    let mut types: Vec<TradeType> = symbols
        .iter()
        .map(|s| TradeType {
            market: s.market.clone(),
            submarket: s.submarket.clone(),
            symbol: s.symbol.clone(),
            display_name: s.display_name.clone(),
        })
        .collect();
    types.sort_by(|a, b| a.sort_key_cmp(b));
    types
}

/// One entry of `contracts_for.available`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractOffer {
    pub contract_type: String,
    #[serde(rename = "min_contract_duration", default)]
    pub min_duration: String,
    #[serde(rename = "max_contract_duration", default)]
    pub max_duration: String,
    #[serde(rename = "barrier_category", default)]
    pub barriers: String,
}

impl ContractOffer {
    /// Split a duration like `"1d"` or `"15m"` into value and unit
    pub fn min_duration_parts(&self) -> Option<(u32, DurationUnit)> {
        split_duration(&self.min_duration)
    }

    pub fn max_duration_parts(&self) -> Option<(u32, DurationUnit)> {
        split_duration(&self.max_duration)
    }
}

fn split_duration(raw: &str) -> Option<(u32, DurationUnit)> {
    let raw = raw.trim();
    let digits_end = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(digits_end);
    let value = digits.parse::<u32>().ok()?;
    let unit = unit.trim().parse::<DurationUnit>().ok()?;
    Some((value, unit))
}

/// A price tick from the `ticks` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: Decimal,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    pub epoch: i64,
    #[serde(default)]
    pub id: Option<String>,
}

impl Tick {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.epoch, 0)
    }
}

/// Account balance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub balance: Decimal,
    pub currency: String,
    #[serde(default)]
    pub loginid: Option<String>,
}

/// Result of a successful `authorize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub fullname: Option<String>,
}

/// Server-computed price for a prospective trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub ask_price: Decimal,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub spot: Option<Decimal>,
    #[serde(default)]
    pub longcode: Option<String>,
}

/// Buy confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyReceipt {
    #[serde(deserialize_with = "string_or_number")]
    pub contract_id: String,
    pub buy_price: Decimal,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub longcode: Option<String>,
}

/// Sell confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleReceipt {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub contract_id: Option<String>,
    pub sold_for: Decimal,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub transaction_id: Option<String>,
}

/// Live details of an open contract (`proposal_open_contract`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenContractDetails {
    #[serde(deserialize_with = "string_or_number")]
    pub contract_id: String,
    pub underlying: String,
    #[serde(default)]
    pub current_spot: Option<Decimal>,
    #[serde(default)]
    pub buy_price: Option<Decimal>,
    #[serde(default)]
    pub bid_price: Option<Decimal>,
    #[serde(default, deserialize_with = "bool_from_int")]
    pub is_valid_to_sell: bool,
    #[serde(default)]
    pub status: Option<String>,
}

/// One open position from `portfolio`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioContract {
    #[serde(deserialize_with = "string_or_number")]
    pub contract_id: String,
    pub symbol: String,
    pub contract_type: String,
    pub buy_price: Decimal,
    #[serde(default)]
    pub payout: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub expiry_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn symbol(market: &str, submarket: &str, name: &str) -> ActiveSymbol {
        ActiveSymbol {
            symbol: name.to_uppercase(),
            display_name: name.to_string(),
            market: market.to_string(),
            submarket: submarket.to_string(),
            exchange_is_open: true,
            is_trading_suspended: false,
        }
    }

    #[test]
    fn test_trade_types_sorted() {
        let symbols = vec![
            symbol("synthetic_index", "random_index", "Volatility 100"),
            symbol("forex", "major_pairs", "GBP/USD"),
            symbol("forex", "major_pairs", "AUD/USD"),
            symbol("forex", "minor_pairs", "AUD/CAD"),
        ];

        let sorted: Vec<String> = sorted_trade_types(&symbols)
            .into_iter()
            .map(|t| t.display_name)
            .collect();
        assert_eq!(
            sorted,
            vec!["AUD/USD", "GBP/USD", "AUD/CAD", "Volatility 100"]
        );
    }

    #[test]
    fn test_active_symbol_int_flags() {
        let raw = json!({
            "symbol": "OTC_SPC",
            "display_name": "US 500",
            "market": "indices",
            "submarket": "americas_OTC",
            "exchange_is_open": 0,
            "is_trading_suspended": 0
        });
        let parsed: ActiveSymbol = serde_json::from_value(raw).unwrap();
        assert!(!parsed.exchange_is_open);
        assert!(!parsed.is_tradable());
    }

    #[test]
    fn test_contract_offer_duration_parts() {
        let offer = ContractOffer {
            contract_type: "PUT".to_string(),
            min_duration: "1d".to_string(),
            max_duration: "365d".to_string(),
            barriers: "euro_atm".to_string(),
        };
        assert_eq!(offer.min_duration_parts(), Some((1, DurationUnit::Day)));
        assert_eq!(offer.max_duration_parts(), Some((365, DurationUnit::Day)));

        let bad = ContractOffer {
            min_duration: "soon".to_string(),
            ..offer
        };
        assert_eq!(bad.min_duration_parts(), None);
    }

    #[test]
    fn test_buy_receipt_numeric_ids() {
        let raw = json!({
            "contract_id": 123456789,
            "buy_price": 8.5,
            "payout": 16.23,
            "transaction_id": 987654321
        });
        let receipt: BuyReceipt = serde_json::from_value(raw).unwrap();
        assert_eq!(receipt.contract_id, "123456789");
        assert_eq!(receipt.transaction_id.as_deref(), Some("987654321"));
    }
}
