use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::broker::{
    AccountSnapshot, Bar, Broker, BrokerError, DataFeed, OrderAck, OrderFilter, OrderRequest,
    Quote, TimeInForce,
};
use crate::config::BrokerConfig;
use crate::model::{
    occ_expiration_of, occ_right, occ_strike_of, occ_underlying, AssetClass, OpenOrder,
    OptionContract, OrderSide, OrderStatus, Position,
};
use crate::rate_limiter::TokenBucket;

/// Header used to send the key-id authentication
const API_KEY_HEADER: &str = "APCA-API-KEY-ID";
/// Header used to send the secret-key for authentication
const API_SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

const LIVE_TRADING_URL: &str = "https://api.alpaca.markets";
const PAPER_TRADING_URL: &str = "https://paper-api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";

const DATA_TIMEOUT: Duration = Duration::from_secs(15);
const ORDER_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct AlpacaBroker {
    api_key: String,
    secret_key: String,
    trading_url: String,
    data_url: String,
    client: Client,
    http_limiter: TokenBucket,
}

impl AlpacaBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let api_key = config.get_api_key().ok_or_else(|| {
            BrokerError::Config("APCA_API_KEY_ID not set (check config.json or env)".to_string())
        })?;
        let secret_key = config.get_secret_key().ok_or_else(|| {
            BrokerError::Config(
                "APCA_API_SECRET_KEY not set (check config.json or env)".to_string(),
            )
        })?;

        let trading_url = std::env::var("APCA_API_BASE_URL").unwrap_or_else(|_| {
            if config.paper {
                PAPER_TRADING_URL.to_string()
            } else {
                LIVE_TRADING_URL.to_string()
            }
        });

        let client = Client::builder()
            .timeout(DATA_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Config(format!("http client: {}", e)))?;

        // Alpaca allows 200 req/min on the trading API.
        let http_limiter = TokenBucket::new(10, 3.0);

        Ok(AlpacaBroker {
            api_key,
            secret_key,
            trading_url,
            data_url: DATA_URL.to_string(),
            client,
            http_limiter,
        })
    }

    fn map_send_error(e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::Timeout(e.to_string())
        } else {
            BrokerError::Network(e.to_string())
        }
    }

    async fn get_json_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, BrokerError> {
        self.http_limiter.acquire().await;

        let resp = self
            .client
            .get(url)
            .query(query)
            .header(API_KEY_HEADER, &self.api_key)
            .header(API_SECRET_HEADER, &self.secret_key)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_send_error)?;

        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited);
        }
        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| BrokerError::Parse(format!("{}: {}", url, e)))
    }

    /// GET with a single fixed-backoff retry on transient failure. Used for
    /// data fetches only; `submit_order` never retries.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, BrokerError> {
        match self.get_json_once(url, query).await {
            Err(e) if e.is_transient() => {
                warn!(url, error = %e, "transient broker error, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.get_json_once(url, query).await
            }
            other => other,
        }
    }
}

// --- Wire shapes (Alpaca returns decimals as JSON strings) ---

#[derive(Deserialize)]
struct AccountWire {
    buying_power: Decimal,
    #[serde(default)]
    options_buying_power: Option<Decimal>,
    cash: Decimal,
    portfolio_value: Decimal,
    equity: Decimal,
}

#[derive(Deserialize)]
struct SnapshotWire {
    #[serde(rename = "latestQuote")]
    latest_quote: Option<QuoteWire>,
    #[serde(rename = "latestTrade")]
    latest_trade: Option<TradeWire>,
    #[serde(rename = "prevDailyBar")]
    prev_daily_bar: Option<BarWire>,
}

#[derive(Deserialize)]
struct QuoteWire {
    #[serde(rename = "bp")]
    bid: Decimal,
    #[serde(rename = "ap")]
    ask: Decimal,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct TradeWire {
    #[serde(rename = "p")]
    price: Decimal,
}

#[derive(Deserialize)]
struct BarWire {
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: u64,
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct BarsWire {
    bars: Option<Vec<BarWire>>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct OptionSnapshotWire {
    #[serde(rename = "latestQuote")]
    latest_quote: Option<QuoteWire>,
    greeks: Option<GreeksWire>,
    #[serde(rename = "openInterest", default)]
    open_interest: u64,
    #[serde(rename = "dailyBar")]
    daily_bar: Option<BarWire>,
}

#[derive(Deserialize)]
struct GreeksWire {
    delta: f64,
}

#[derive(Deserialize)]
struct OptionChainWire {
    snapshots: HashMap<String, OptionSnapshotWire>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct PositionWire {
    symbol: String,
    asset_class: String,
    qty: Decimal,
    avg_entry_price: Decimal,
    market_value: Decimal,
    unrealized_pl: Decimal,
}

#[derive(Deserialize)]
struct OrderWire {
    id: String,
    symbol: String,
    status: String,
    side: String,
    qty: Decimal,
    limit_price: Option<Decimal>,
}

fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "new" | "accepted" | "open" | "partially_filled" => OrderStatus::Open,
        "pending_new" | "accepted_for_bidding" => OrderStatus::PendingNew,
        "filled" => OrderStatus::Filled,
        "canceled" | "expired" | "done_for_day" | "replaced" => OrderStatus::Canceled,
        _ => OrderStatus::Rejected,
    }
}

#[async_trait]
impl Broker for AlpacaBroker {
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let url = format!("{}/v2/account", self.trading_url);
        let wire: AccountWire = self.get_json(&url, &[]).await?;
        Ok(AccountSnapshot {
            options_buying_power: wire.options_buying_power.unwrap_or(wire.buying_power),
            buying_power: wire.buying_power,
            cash: wire.cash,
            portfolio_value: wire.portfolio_value,
            equity: wire.equity,
        })
    }

    async fn get_quote(&self, symbol: &str, feed: DataFeed) -> Result<Quote, BrokerError> {
        let url = format!("{}/v2/stocks/{}/snapshot", self.data_url, symbol);
        let query = [("feed", feed.as_str().to_string())];
        let wire: SnapshotWire = self.get_json(&url, &query).await?;

        let quote = wire
            .latest_quote
            .ok_or_else(|| BrokerError::Parse(format!("{}: snapshot missing quote", symbol)))?;
        let last = wire
            .latest_trade
            .map(|t| t.price)
            .ok_or_else(|| BrokerError::Parse(format!("{}: snapshot missing trade", symbol)))?;
        let prev_close = wire
            .prev_daily_bar
            .map(|b| b.close)
            .ok_or_else(|| BrokerError::Parse(format!("{}: snapshot missing prev bar", symbol)))?;

        Ok(Quote {
            bid: quote.bid,
            ask: quote.ask,
            last,
            prev_close,
            timestamp: quote.timestamp,
        })
    }

    async fn get_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        feed: DataFeed,
    ) -> Result<Vec<Bar>, BrokerError> {
        let url = format!("{}/v2/stocks/{}/bars", self.data_url, symbol);
        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeframe", "1Day".to_string()),
                ("start", start.to_rfc3339()),
                ("end", end.to_rfc3339()),
                ("feed", feed.as_str().to_string()),
                ("limit", "1000".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let wire: BarsWire = self.get_json(&url, &query).await?;
            for b in wire.bars.unwrap_or_default() {
                bars.push(Bar {
                    open: b.open,
                    high: b.high,
                    low: b.low,
                    close: b.close,
                    volume: b.volume,
                    timestamp: b.timestamp,
                });
            }

            match wire.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(bars)
    }

    async fn get_option_chain(
        &self,
        underlying: &str,
    ) -> Result<Vec<OptionContract>, BrokerError> {
        let url = format!("{}/v1beta1/options/snapshots/{}", self.data_url, underlying);
        let today = Utc::now().date_naive();
        let mut contracts = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("limit", "1000".to_string())];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let wire: OptionChainWire = self.get_json(&url, &query).await?;
            for (occ_symbol, snap) in wire.snapshots {
                // Contracts without a quote or greeks cannot be priced; skip
                // rather than fabricate fields downstream sizing depends on.
                let (quote, greeks) = match (snap.latest_quote, snap.greeks) {
                    (Some(q), Some(g)) => (q, g),
                    _ => continue,
                };
                let (strike, expiration) =
                    match (occ_strike_of(&occ_symbol), occ_expiration_of(&occ_symbol)) {
                        (Some(s), Some(e)) => (s, e),
                        _ => {
                            warn!(occ_symbol = %occ_symbol, "unparseable OCC symbol in chain, skipping");
                            continue;
                        }
                    };
                let right = match occ_right(&occ_symbol) {
                    Some(r) => r,
                    None => continue,
                };

                contracts.push(OptionContract {
                    underlying: occ_underlying(&occ_symbol).to_string(),
                    right,
                    strike,
                    dte: (expiration - today).num_days(),
                    expiration,
                    bid: quote.bid,
                    ask: quote.ask,
                    mid: (quote.bid + quote.ask) / Decimal::from(2),
                    delta: greeks.delta,
                    open_interest: snap.open_interest,
                    volume: snap.daily_bar.map(|b| b.volume).unwrap_or(0),
                    occ_symbol,
                });
            }

            match wire.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(contracts)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let url = format!("{}/v2/positions", self.trading_url);
        let wire: Vec<PositionWire> = self.get_json(&url, &[]).await?;

        Ok(wire
            .into_iter()
            .map(|p| Position {
                asset_class: if p.asset_class == "us_option" {
                    AssetClass::Option
                } else {
                    AssetClass::Equity
                },
                symbol: p.symbol,
                quantity: p.qty,
                entry_price: p.avg_entry_price,
                market_value: p.market_value,
                unrealized_pnl: p.unrealized_pl,
            })
            .collect())
    }

    async fn get_orders(&self, filter: OrderFilter) -> Result<Vec<OpenOrder>, BrokerError> {
        let url = format!("{}/v2/orders", self.trading_url);
        let status = match filter {
            OrderFilter::Working => "open",
            OrderFilter::All => "all",
        };
        let query = [
            ("status", status.to_string()),
            ("limit", "500".to_string()),
        ];
        let wire: Vec<OrderWire> = self.get_json(&url, &query).await?;

        Ok(wire
            .into_iter()
            .map(|o| OpenOrder {
                order_id: o.id,
                status: map_order_status(&o.status),
                side: if o.side == "buy" {
                    OrderSide::BuyToClose
                } else {
                    OrderSide::SellToOpen
                },
                symbol: o.symbol,
                quantity: o.qty,
                limit_price: o.limit_price,
            })
            .collect())
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        self.http_limiter.acquire().await;

        let url = format!("{}/v2/orders", self.trading_url);
        let side = match order.side {
            OrderSide::SellToOpen => "sell",
            OrderSide::BuyToClose => "buy",
        };
        let tif = match order.time_in_force {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
        };
        let body = serde_json::json!({
            "symbol": order.symbol,
            "qty": order.quantity.to_string(),
            "side": side,
            "type": "limit",
            "limit_price": order.limit_price.to_string(),
            "time_in_force": tif,
            "client_order_id": order.client_order_id,
        });

        // Never retried: a timed-out submit may still have reached the
        // broker, and a second attempt would risk a duplicate position.
        let resp = self
            .client
            .post(&url)
            .timeout(ORDER_TIMEOUT)
            .header(API_KEY_HEADER, &self.api_key)
            .header(API_SECRET_HEADER, &self.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(Self::map_send_error)?;

        if status.as_u16() == 429 {
            return Err(BrokerError::RateLimited);
        }
        if !status.is_success() {
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        let wire: OrderWire = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Parse(format!("order ack: {}", e)))?;
        Ok(OrderAck {
            order_id: wire.id,
            status: map_order_status(&wire.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_mapping() {
        assert_eq!(map_order_status("new"), OrderStatus::Open);
        assert_eq!(map_order_status("pending_new"), OrderStatus::PendingNew);
        assert_eq!(map_order_status("filled"), OrderStatus::Filled);
        assert_eq!(map_order_status("canceled"), OrderStatus::Canceled);
        assert_eq!(map_order_status("rejected"), OrderStatus::Rejected);
    }
}
