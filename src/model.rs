use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptionRight {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "CALL")]
    Call,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssetClass {
    #[serde(rename = "EQUITY")]
    Equity,
    #[serde(rename = "OPTION")]
    Option,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    #[serde(rename = "PENDING_NEW")]
    PendingNew,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl OrderStatus {
    /// Working orders still consume the underlying for duplicate checks.
    pub fn is_working(&self) -> bool {
        matches!(self, OrderStatus::PendingNew | OrderStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    #[serde(rename = "SELL_TO_OPEN")]
    SellToOpen,
    #[serde(rename = "BUY_TO_CLOSE")]
    BuyToClose,
}

/// Per-underlying phase of the wheel. Derived from live broker state on
/// every call, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WheelPhase {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "SELLING_PUTS")]
    SellingPuts,
    #[serde(rename = "HOLDING_STOCK")]
    HoldingStock,
    #[serde(rename = "SELLING_CALLS")]
    SellingCalls,
}

/// A candidate equity at scan entry. Immutable within a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Underlying {
    pub symbol: String,
    pub price: Decimal,
    pub avg_volume: u64,
    pub historical_volatility: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ContractError {
    #[error("crossed quote: bid {bid} > ask {ask}")]
    CrossedQuote { bid: Decimal, ask: Decimal },
    #[error("delta {0} outside [-1, 1]")]
    DeltaOutOfRange(f64),
    #[error("non-positive mid {0}")]
    NonPositiveMid(Decimal),
    #[error("negative dte {0}")]
    NegativeDte(i64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub occ_symbol: String,
    pub underlying: String,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub dte: i64,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub delta: f64,
    pub open_interest: u64,
    pub volume: u64,
}

impl OptionContract {
    /// Data-shape validation. A contract failing this never reaches
    /// selection; the containing stage reports a detection error.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.bid > self.ask {
            return Err(ContractError::CrossedQuote {
                bid: self.bid,
                ask: self.ask,
            });
        }
        if self.delta.abs() > 1.0 || !self.delta.is_finite() {
            return Err(ContractError::DeltaOutOfRange(self.delta));
        }
        if self.mid <= Decimal::ZERO {
            return Err(ContractError::NonPositiveMid(self.mid));
        }
        if self.dte < 0 {
            return Err(ContractError::NegativeDte(self.dte));
        }
        Ok(())
    }

    /// Cash reserved by the broker per short contract lot.
    pub fn collateral(&self, contracts: u32) -> Decimal {
        self.strike * Decimal::from(100) * Decimal::from(contracts)
    }
}

/// An OptionContract that survived chain selection, carrying its ranking
/// metadata. Every field Stage 8 sizing needs is populated before the
/// store accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    #[serde(flatten)]
    pub contract: OptionContract,
    pub score: f64,
    pub annual_return_estimate: f64,
    pub expected_premium: Decimal,
}

impl Opportunity {
    pub fn underlying(&self) -> &str {
        &self.contract.underlying
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "EXECUTED")]
    Executed,
}

/// The scan→execute handoff record, persisted as one JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanArtifact {
    pub scan_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    pub opportunities: Vec<Opportunity>,
}

/// A position as reported by the broker. Observed, never cached across
/// cycle boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Position {
    pub fn underlying(&self) -> &str {
        match self.asset_class {
            AssetClass::Equity => &self.symbol,
            AssetClass::Option => occ_underlying(&self.symbol),
        }
    }

    pub fn is_short_option(&self) -> bool {
        self.asset_class == AssetClass::Option && self.quantity < Decimal::ZERO
    }

    pub fn option_right(&self) -> Option<OptionRight> {
        if self.asset_class != AssetClass::Option {
            return None;
        }
        occ_right(&self.symbol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
}

impl OpenOrder {
    pub fn underlying(&self) -> &str {
        occ_underlying(&self.symbol)
    }
}

/// Extract the underlying root from an OCC option symbol
/// (e.g. "AMD260807P00145000" -> "AMD"). Symbols that do not carry the
/// 15-character date/right/strike suffix are returned unchanged, so the
/// helper is safe on plain equity symbols.
pub fn occ_underlying(symbol: &str) -> &str {
    if let Some(root_len) = occ_root_len(symbol) {
        &symbol[..root_len]
    } else {
        symbol
    }
}

/// Extract the right (P/C) from an OCC option symbol, if it is one.
pub fn occ_right(symbol: &str) -> Option<OptionRight> {
    let root_len = occ_root_len(symbol)?;
    match symbol.as_bytes()[root_len + 6] {
        b'P' => Some(OptionRight::Put),
        b'C' => Some(OptionRight::Call),
        _ => None,
    }
}

/// Extract the strike from an OCC option symbol (8 trailing digits,
/// price * 1000).
pub fn occ_strike_of(symbol: &str) -> Option<Decimal> {
    occ_root_len(symbol)?;
    let raw: i64 = symbol[symbol.len() - 8..].parse().ok()?;
    Some(Decimal::new(raw, 3))
}

/// Extract the expiration date from an OCC option symbol (YYMMDD).
pub fn occ_expiration_of(symbol: &str) -> Option<NaiveDate> {
    let root_len = occ_root_len(symbol)?;
    let date = &symbol[root_len..root_len + 6];
    let yy: i32 = date[0..2].parse().ok()?;
    let mm: u32 = date[2..4].parse().ok()?;
    let dd: u32 = date[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + yy, mm, dd)
}

fn occ_root_len(symbol: &str) -> Option<usize> {
    // OCC suffix: YYMMDD + P/C + 8-digit strike (price * 1000)
    if symbol.len() <= 15 || !symbol.is_ascii() {
        return None;
    }
    let root_len = symbol.len() - 15;
    let suffix = &symbol.as_bytes()[root_len..];
    let date_ok = suffix[..6].iter().all(|b| b.is_ascii_digit());
    let right_ok = suffix[6] == b'P' || suffix[6] == b'C';
    let strike_ok = suffix[7..].iter().all(|b| b.is_ascii_digit());
    if date_ok && right_ok && strike_ok {
        Some(root_len)
    } else {
        None
    }
}
