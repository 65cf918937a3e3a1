use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ContractState;
use crate::error::{DerivError, Result};

/// Contract direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContractType {
    /// Rise
    Call,
    /// Fall
    Put,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Call => "CALL",
            ContractType::Put => "PUT",
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContractType {
    type Err = DerivError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CALL" => Ok(ContractType::Call),
            "PUT" => Ok(ContractType::Put),
            other => Err(DerivError::InvalidParameters(format!(
                "unknown contract type '{other}'; expected CALL|PUT"
            ))),
        }
    }
}

/// Contract duration unit as understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Tick,
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
}

impl DurationUnit {
    pub const ALL: [DurationUnit; 5] = [
        DurationUnit::Tick,
        DurationUnit::Second,
        DurationUnit::Minute,
        DurationUnit::Hour,
        DurationUnit::Day,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Tick => "t",
            DurationUnit::Second => "s",
            DurationUnit::Minute => "m",
            DurationUnit::Hour => "h",
            DurationUnit::Day => "d",
        }
    }
}

impl fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DurationUnit {
    type Err = DerivError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "t" => Ok(DurationUnit::Tick),
            "s" => Ok(DurationUnit::Second),
            "m" => Ok(DurationUnit::Minute),
            "h" => Ok(DurationUnit::Hour),
            "d" => Ok(DurationUnit::Day),
            other => Err(DerivError::InvalidParameters(format!(
                "invalid duration unit '{other}'; expected one of t,s,m,h,d"
            ))),
        }
    }
}

/// Push a day-unit expiry off the weekend: Saturday +2, Sunday +1.
pub fn adjust_duration_for_weekends(
    duration: u32,
    unit: DurationUnit,
    today: NaiveDate,
) -> Result<u32> {
    if unit != DurationUnit::Day {
        return Ok(duration);
    }

    let out_of_range =
        || DerivError::InvalidParameters(format!("duration of {duration} days is out of range"));
    let expiry = today
        .checked_add_days(Days::new(u64::from(duration)))
        .ok_or_else(out_of_range)?;
    let extra = match expiry.weekday() {
        Weekday::Sat => 2,
        Weekday::Sun => 1,
        _ => 0,
    };
    duration.checked_add(extra).ok_or_else(out_of_range)
}

/// Which way a barrier sits relative to spot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierSide {
    /// Take-profit: percentage offsets are added to spot
    Above,
    /// Stop-loss: percentage offsets are subtracted from spot
    Below,
}

/// Take-profit / stop-loss specification: `"15%"` or `"150.0"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierSpec {
    Percent(Decimal),
    Absolute(Decimal),
}

impl BarrierSpec {
    /// Barrier price, rounded to two decimals.
    ///
    /// Percentages are relative to `spot`; absolute values pass through.
    /// A stop-loss of 100% or more, or a level that overflows, is rejected.
    pub fn resolve(&self, spot: Decimal, side: BarrierSide) -> Result<Decimal> {
        let raw = match (self, side) {
            (BarrierSpec::Absolute(price), _) => Some(*price),
            (BarrierSpec::Percent(pct), BarrierSide::Above) => pct
                .checked_div(Decimal::ONE_HUNDRED)
                .and_then(|offset| Decimal::ONE.checked_add(offset))
                .and_then(|factor| spot.checked_mul(factor)),
            (BarrierSpec::Percent(pct), BarrierSide::Below) => {
                if *pct >= Decimal::ONE_HUNDRED {
                    return Err(DerivError::InvalidParameters(format!(
                        "stop-loss of {pct}% puts the barrier at or below zero"
                    )));
                }
                pct.checked_div(Decimal::ONE_HUNDRED)
                    .and_then(|offset| Decimal::ONE.checked_sub(offset))
                    .and_then(|factor| spot.checked_mul(factor))
            }
        };
        raw.map(to_price).ok_or_else(|| {
            DerivError::InvalidParameters(format!("barrier {self} is out of range at spot {spot}"))
        })
    }

    pub fn is_percent(&self) -> bool {
        matches!(self, BarrierSpec::Percent(_))
    }
}

impl FromStr for BarrierSpec {
    type Err = DerivError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (number, percent) = match trimmed.strip_suffix('%') {
            Some(stripped) => (stripped.trim(), true),
            None => (trimmed, false),
        };

        let value = Decimal::from_str(number).map_err(|e| {
            DerivError::InvalidParameters(format!("invalid barrier '{raw}': {e}"))
        })?;

        if value.is_sign_negative() {
            return Err(DerivError::InvalidParameters(format!(
                "barrier '{raw}' must not be negative"
            )));
        }

        Ok(if percent {
            BarrierSpec::Percent(value)
        } else {
            BarrierSpec::Absolute(value)
        })
    }
}

impl fmt::Display for BarrierSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierSpec::Percent(p) => write!(f, "{p}%"),
            BarrierSpec::Absolute(v) => write!(f, "{v}"),
        }
    }
}

/// Round to two decimals with a fixed scale so it prints as `150.00`
pub fn to_price(value: Decimal) -> Decimal {
    let mut price = value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    price.rescale(2);
    price
}

/// What the caller wants to trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    /// Stake in account currency
    pub amount: Decimal,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub contract_type: ContractType,
    #[serde(default)]
    pub take_profit: Option<BarrierSpec>,
    #[serde(default)]
    pub stop_loss: Option<BarrierSpec>,
}

impl OrderSpec {
    pub fn new(
        symbol: &str,
        amount: Decimal,
        duration: u32,
        duration_unit: DurationUnit,
        contract_type: ContractType,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            amount,
            duration,
            duration_unit,
            contract_type,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn with_limits(mut self, tp: Option<BarrierSpec>, sl: Option<BarrierSpec>) -> Self {
        self.take_profit = tp;
        self.stop_loss = sl;
        self
    }

    /// Caller-side checks that never need the server
    pub fn validate(&self, allowed_units: &[DurationUnit]) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(DerivError::InvalidParameters(
                "symbol cannot be empty".to_string(),
            ));
        }

        if self.amount <= Decimal::ZERO {
            return Err(DerivError::InvalidParameters(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }

        if self.duration == 0 {
            return Err(DerivError::InvalidParameters(
                "duration must be positive".to_string(),
            ));
        }

        if !allowed_units.contains(&self.duration_unit) {
            return Err(DerivError::InvalidParameters(format!(
                "duration unit '{}' is not allowed",
                self.duration_unit
            )));
        }

        Ok(())
    }
}

/// Resolved barrier prices currently applied to an open contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barriers {
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

/// A contract tracked through its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    /// Server-assigned; present iff state is at or past `Open`
    pub contract_id: Option<String>,
    pub symbol: String,
    pub stake: Decimal,
    pub contract_type: ContractType,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    pub take_profit: Option<BarrierSpec>,
    pub stop_loss: Option<BarrierSpec>,
    pub proposal_id: Option<String>,
    pub buy_price: Option<Decimal>,
    pub payout: Option<Decimal>,
    pub barriers: Barriers,
    pub sold_for: Option<Decimal>,
    pub state: ContractState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn from_spec(spec: &OrderSpec) -> Self {
        let now = Utc::now();
        Self {
            contract_id: None,
            symbol: spec.symbol.clone(),
            stake: spec.amount,
            contract_type: spec.contract_type,
            duration: spec.duration,
            duration_unit: spec.duration_unit,
            take_profit: spec.take_profit,
            stop_loss: spec.stop_loss,
            proposal_id: None,
            buy_price: None,
            payout: None,
            barriers: Barriers::default(),
            sold_for: None,
            state: ContractState::Quoting,
            created_at: now,
            updated_at: now,
        }
    }

    /// A contract bought elsewhere and found open on the account.
    ///
    /// Duration is not reported by the portfolio, so it is left at zero.
    pub fn adopted(
        contract_id: &str,
        symbol: &str,
        contract_type: ContractType,
        buy_price: Decimal,
        payout: Option<Decimal>,
    ) -> Self {
        let now = Utc::now();
        Self {
            contract_id: Some(contract_id.to_string()),
            symbol: symbol.to_string(),
            stake: buy_price,
            contract_type,
            duration: 0,
            duration_unit: DurationUnit::Day,
            take_profit: None,
            stop_loss: None,
            proposal_id: None,
            buy_price: Some(buy_price),
            payout,
            barriers: Barriers::default(),
            sold_for: None,
            state: ContractState::Open,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.contract_id.as_deref()
    }

    /// Move to `target`, refusing illegal edges and id-less open states
    pub fn transition(&mut self, target: ContractState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(DerivError::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }

        if target.has_server_id() && self.contract_id.is_none() {
            return Err(DerivError::InvalidStateTransition {
                from: self.state.to_string(),
                to: format!("{target} (no contract id)"),
            });
        }

        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record the buy confirmation and enter `Open`
    pub fn mark_open(
        &mut self,
        contract_id: String,
        buy_price: Option<Decimal>,
        payout: Option<Decimal>,
    ) -> Result<()> {
        if self.state != ContractState::Buying {
            return Err(DerivError::InvalidStateTransition {
                from: self.state.to_string(),
                to: ContractState::Open.to_string(),
            });
        }
        self.contract_id = Some(contract_id);
        self.buy_price = buy_price;
        self.payout = payout;
        self.transition(ContractState::Open)
    }

    /// Require `Open` before a lifecycle operation
    pub fn ensure_open(&self) -> Result<&str> {
        match (self.state, self.contract_id.as_deref()) {
            (ContractState::Open, Some(id)) => Ok(id),
            (state, _) => Err(DerivError::InvalidStateTransition {
                from: state.to_string(),
                to: "an operation that requires OPEN".to_string(),
            }),
        }
    }

    /// Profit or loss once sold
    pub fn realized_pnl(&self) -> Option<Decimal> {
        match (self.sold_for, self.buy_price) {
            (Some(sold), Some(bought)) => Some(sold - bought),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_percentage_barriers() {
        let spot = dec!(100);
        let tp: BarrierSpec = "15%".parse().unwrap();
        let sl: BarrierSpec = "10%".parse().unwrap();

        assert_eq!(tp.resolve(spot, BarrierSide::Above).unwrap().to_string(), "115.00");
        assert_eq!(sl.resolve(spot, BarrierSide::Below).unwrap().to_string(), "90.00");
    }

    #[test]
    fn test_absolute_barriers_ignore_spot() {
        let spot = dec!(140);
        let tp: BarrierSpec = "150.0".parse().unwrap();
        let sl: BarrierSpec = "100.0".parse().unwrap();

        assert!(!tp.is_percent());
        assert_eq!(tp.resolve(spot, BarrierSide::Above).unwrap().to_string(), "150.00");
        assert_eq!(sl.resolve(spot, BarrierSide::Below).unwrap().to_string(), "100.00");
    }

    #[test]
    fn test_barrier_parse_rejects_garbage() {
        assert!("abc".parse::<BarrierSpec>().is_err());
        assert!("%".parse::<BarrierSpec>().is_err());
        assert!("-5%".parse::<BarrierSpec>().is_err());
        assert_eq!(
            " 2.5 % ".parse::<BarrierSpec>().unwrap(),
            BarrierSpec::Percent(dec!(2.5))
        );
    }

    #[test]
    fn test_barrier_rounding() {
        let tp = BarrierSpec::Percent(dec!(1));
        // 123.456 * 1.01 = 124.69056
        assert_eq!(tp.resolve(dec!(123.456), BarrierSide::Above).unwrap(), dec!(124.69));
    }

    #[test]
    fn test_barrier_out_of_range_is_rejected() {
        let huge: BarrierSpec = "79228162514264337593543950335%".parse().unwrap();
        assert!(matches!(
            huge.resolve(dec!(140), BarrierSide::Above),
            Err(DerivError::InvalidParameters(_))
        ));
        assert!(matches!(
            huge.resolve(dec!(140), BarrierSide::Below),
            Err(DerivError::InvalidParameters(_))
        ));

        let wipeout = BarrierSpec::Percent(dec!(100));
        assert!(matches!(
            wipeout.resolve(dec!(140), BarrierSide::Below),
            Err(DerivError::InvalidParameters(_))
        ));
        // the same percentage is a valid take-profit
        assert_eq!(wipeout.resolve(dec!(140), BarrierSide::Above).unwrap(), dec!(280.00));
    }

    #[test]
    fn test_duration_unit_parse() {
        assert_eq!("d".parse::<DurationUnit>().unwrap(), DurationUnit::Day);
        assert_eq!("T".parse::<DurationUnit>().unwrap(), DurationUnit::Tick);
        assert!(matches!(
            "w".parse::<DurationUnit>(),
            Err(DerivError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_order_spec_validation() {
        let spec = OrderSpec::new("R_100", dec!(8.5), 1, DurationUnit::Day, ContractType::Put);
        assert!(spec.validate(&DurationUnit::ALL).is_ok());

        let zero = OrderSpec::new("R_100", dec!(0), 1, DurationUnit::Day, ContractType::Put);
        assert!(matches!(
            zero.validate(&DurationUnit::ALL),
            Err(DerivError::InvalidParameters(_))
        ));

        let no_ticks = [DurationUnit::Day];
        let ticks = OrderSpec::new("R_100", dec!(1), 5, DurationUnit::Tick, ContractType::Call);
        assert!(ticks.validate(&no_ticks).is_err());
    }

    #[test]
    fn test_weekend_adjustment() {
        // 2024-06-07 is a Friday
        let friday = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        assert_eq!(adjust_duration_for_weekends(1, DurationUnit::Day, friday).unwrap(), 3);
        assert_eq!(adjust_duration_for_weekends(2, DurationUnit::Day, friday).unwrap(), 3);
        assert_eq!(adjust_duration_for_weekends(3, DurationUnit::Day, friday).unwrap(), 3);
        assert_eq!(adjust_duration_for_weekends(1, DurationUnit::Hour, friday).unwrap(), 1);
    }

    #[test]
    fn test_weekend_adjustment_rejects_huge_duration() {
        let friday = NaiveDate::from_ymd_opt(2024, 6, 7).unwrap();
        assert!(matches!(
            adjust_duration_for_weekends(u32::MAX, DurationUnit::Day, friday),
            Err(DerivError::InvalidParameters(_))
        ));
        // non-day units are passed through untouched
        assert_eq!(
            adjust_duration_for_weekends(u32::MAX, DurationUnit::Tick, friday).unwrap(),
            u32::MAX
        );
    }

    #[test]
    fn test_contract_requires_id_to_open() {
        let spec = OrderSpec::new("R_100", dec!(8.5), 1, DurationUnit::Day, ContractType::Put);
        let mut contract = Contract::from_spec(&spec);

        contract.transition(ContractState::Buying).unwrap();
        assert!(contract.transition(ContractState::Open).is_err());

        contract
            .mark_open("C1".to_string(), Some(dec!(8.5)), Some(dec!(16.2)))
            .unwrap();
        assert_eq!(contract.state, ContractState::Open);
        assert_eq!(contract.ensure_open().unwrap(), "C1");
    }

    #[test]
    fn test_realized_pnl() {
        let spec = OrderSpec::new("R_100", dec!(10), 1, DurationUnit::Day, ContractType::Call);
        let mut contract = Contract::from_spec(&spec);
        contract.buy_price = Some(dec!(10));
        contract.sold_for = Some(dec!(12.5));
        assert_eq!(contract.realized_pnl(), Some(dec!(2.5)));
    }
}
