//! Text trading commands such as `buy R_100` or `cancel`.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{adjust_duration_for_weekends, BarrierSpec, ContractType, DurationUnit, OrderSpec};
use crate::error::{DerivError, Result};

/// Parameters accompanying a command, keyed the way signal sources send them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandParams {
    /// Stake
    #[serde(rename = "Q", default)]
    pub quantity: Option<Decimal>,
    /// Duration in days
    #[serde(rename = "T", default)]
    pub duration: Option<u32>,
    #[serde(rename = "TP", default)]
    pub take_profit: Option<String>,
    #[serde(rename = "SL", default)]
    pub stop_loss: Option<String>,
    #[serde(rename = "contractId", default)]
    pub contract_id: Option<String>,
}

/// A parsed trading command
#[derive(Debug, Clone, PartialEq)]
pub enum TradeCommand {
    /// Quote and buy a contract
    Open(OrderSpec),
    /// Cancel an open contract
    Cancel { contract_id: String },
    /// Stop every tick stream
    Unsubscribe,
}

impl TradeCommand {
    /// Parse `"<action> [symbol]"` with its parameters.
    ///
    /// `buy`, `1` and `long` open a CALL; `sell`, `-1` and `short` open a
    /// PUT. Day durations landing on a weekend are pushed to Monday.
    pub fn parse(command: &str, params: &CommandParams) -> Result<Self> {
        let mut words = command.split_whitespace();
        let action = words
            .next()
            .ok_or_else(|| DerivError::InvalidParameters("empty command".to_string()))?
            .to_ascii_lowercase();
        let symbol = words.next();

        match action.as_str() {
            "buy" | "1" | "long" => Self::open(ContractType::Call, symbol, params),
            "sell" | "-1" | "short" => Self::open(ContractType::Put, symbol, params),
            "cancel" => {
                let contract_id = params
                    .contract_id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| {
                        DerivError::InvalidParameters("cancel needs a contractId".to_string())
                    })?;
                Ok(TradeCommand::Cancel { contract_id })
            }
            "unsubscribe" => Ok(TradeCommand::Unsubscribe),
            other => Err(DerivError::InvalidParameters(format!(
                "unknown command: {other}"
            ))),
        }
    }

    fn open(side: ContractType, symbol: Option<&str>, params: &CommandParams) -> Result<Self> {
        let symbol = symbol.ok_or_else(|| {
            DerivError::InvalidParameters("open command needs a symbol".to_string())
        })?;
        let amount = params
            .quantity
            .ok_or_else(|| DerivError::InvalidParameters("missing quantity (Q)".to_string()))?;
        let duration = params
            .duration
            .ok_or_else(|| DerivError::InvalidParameters("missing duration (T)".to_string()))?;
        let duration =
            adjust_duration_for_weekends(duration, DurationUnit::Day, Utc::now().date_naive())?;

        let take_profit = parse_limit(params.take_profit.as_deref())?;
        let stop_loss = parse_limit(params.stop_loss.as_deref())?;

        Ok(TradeCommand::Open(
            OrderSpec::new(symbol, amount, duration, DurationUnit::Day, side)
                .with_limits(take_profit, stop_loss),
        ))
    }
}

fn parse_limit(raw: Option<&str>) -> Result<Option<BarrierSpec>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some),
    }
}
