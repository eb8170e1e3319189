use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{OpenOrder, OptionContract, OrderSide, OrderStatus, Position};

pub mod alpaca;
pub mod mock;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("rate limited")]
    RateLimited,
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("response parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Transient failures may be retried once in data-fetch paths. Order
    /// submission never retries regardless (double-submit ambiguity).
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Network(_) | BrokerError::Timeout(_) | BrokerError::RateLimited => true,
            BrokerError::Api { status, .. } => *status >= 500,
            BrokerError::Parse(_) | BrokerError::Config(_) => false,
        }
    }
}

/// Data-feed tier, a per-call parameter to accommodate subscription levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFeed {
    #[serde(rename = "sip")]
    Sip,
    #[serde(rename = "iex")]
    Iex,
}

impl DataFeed {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFeed::Sip => "sip",
            DataFeed::Iex => "iex",
        }
    }

    pub fn from_config(name: &str) -> Self {
        match name {
            "sip" => DataFeed::Sip,
            _ => DataFeed::Iex,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub buying_power: Decimal,
    pub options_buying_power: Decimal,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub equity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub prev_close: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "gtc")]
    Gtc,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
    pub limit_price: Decimal,
    pub time_in_force: TimeInForce,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Which orders `get_orders` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilter {
    /// OPEN and PENDING_NEW, the set that still consumes an underlying.
    Working,
    All,
}

/// The brokerage contract the pipeline and executor depend on. Every method
/// may fail transiently or permanently; callers decide retry policy.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn get_quote(&self, symbol: &str, feed: DataFeed) -> Result<Quote, BrokerError>;

    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        feed: DataFeed,
    ) -> Result<Vec<Bar>, BrokerError>;

    async fn get_option_chain(&self, underlying: &str)
        -> Result<Vec<OptionContract>, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn get_orders(&self, filter: OrderFilter) -> Result<Vec<OpenOrder>, BrokerError>;

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError>;
}
