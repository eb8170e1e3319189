//! Programmable in-memory broker for tests. Plays the role the live
//! Alpaca client plays in production: tests preload accounts, quotes,
//! bars, chains, positions and orders, then assert on the submission log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

use crate::broker::{
    AccountSnapshot, Bar, Broker, BrokerError, DataFeed, OrderAck, OrderFilter, OrderRequest,
    Quote,
};
use crate::model::{occ_strike_of, OpenOrder, OptionContract, OrderSide, OrderStatus, Position};

#[derive(Default)]
struct MockState {
    account: Option<AccountSnapshot>,
    quotes: HashMap<String, Quote>,
    bars: HashMap<String, Vec<Bar>>,
    chains: HashMap<String, Vec<OptionContract>>,
    positions: Vec<Position>,
    orders: Vec<OpenOrder>,
    submitted: Vec<OrderRequest>,
    calls: Vec<String>,
    fail_bars: HashSet<String>,
    fail_quotes: HashSet<String>,
    fail_positions: bool,
    fail_orders: bool,
    reject_next_submit: Option<BrokerErrorKind>,
    next_order_seq: u64,
}

/// Which error `submit_order` should synthesize next.
#[derive(Clone, Copy)]
pub enum BrokerErrorKind {
    Transient,
    Permanent,
}

#[derive(Default)]
pub struct MockBroker {
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_account(&self, account: AccountSnapshot) {
        self.state.lock().account = Some(account);
    }

    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.state.lock().quotes.insert(symbol.to_string(), quote);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.state.lock().bars.insert(symbol.to_string(), bars);
    }

    pub fn set_chain(&self, underlying: &str, chain: Vec<OptionContract>) {
        self.state
            .lock()
            .chains
            .insert(underlying.to_string(), chain);
    }

    pub fn add_position(&self, position: Position) {
        self.state.lock().positions.push(position);
    }

    pub fn add_order(&self, order: OpenOrder) {
        self.state.lock().orders.push(order);
    }

    pub fn fail_bars_for(&self, symbol: &str) {
        self.state.lock().fail_bars.insert(symbol.to_string());
    }

    pub fn fail_quote_for(&self, symbol: &str) {
        self.state.lock().fail_quotes.insert(symbol.to_string());
    }

    pub fn fail_position_queries(&self, fail: bool) {
        self.state.lock().fail_positions = fail;
    }

    pub fn fail_order_queries(&self, fail: bool) {
        self.state.lock().fail_orders = fail;
    }

    pub fn reject_next_submit(&self, kind: BrokerErrorKind) {
        self.state.lock().reject_next_submit = Some(kind);
    }

    /// Orders submitted through this broker, in submission sequence.
    pub fn submitted(&self) -> Vec<OrderRequest> {
        self.state.lock().submitted.clone()
    }

    /// Names of every broker method invoked, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn buying_power(&self) -> Decimal {
        self.state
            .lock()
            .account
            .as_ref()
            .map(|a| a.buying_power)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push("get_account".to_string());
        state
            .account
            .clone()
            .ok_or_else(|| BrokerError::Api {
                status: 404,
                message: "no account configured".to_string(),
            })
    }

    async fn get_quote(&self, symbol: &str, _feed: DataFeed) -> Result<Quote, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push(format!("get_quote:{}", symbol));
        if state.fail_quotes.contains(symbol) {
            return Err(BrokerError::Network("quote feed down".to_string()));
        }
        state.quotes.get(symbol).cloned().ok_or(BrokerError::Api {
            status: 404,
            message: format!("no quote for {}", symbol),
        })
    }

    async fn get_bars(
        &self,
        symbol: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _feed: DataFeed,
    ) -> Result<Vec<Bar>, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push(format!("get_bars:{}", symbol));
        if state.fail_bars.contains(symbol) {
            return Err(BrokerError::Parse(format!("malformed bar payload for {}", symbol)));
        }
        Ok(state.bars.get(symbol).cloned().unwrap_or_default())
    }

    async fn get_option_chain(
        &self,
        underlying: &str,
    ) -> Result<Vec<OptionContract>, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push(format!("get_option_chain:{}", underlying));
        Ok(state.chains.get(underlying).cloned().unwrap_or_default())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push("get_positions".to_string());
        if state.fail_positions {
            return Err(BrokerError::Timeout("positions query".to_string()));
        }
        Ok(state.positions.clone())
    }

    async fn get_orders(&self, filter: OrderFilter) -> Result<Vec<OpenOrder>, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push("get_orders".to_string());
        if state.fail_orders {
            return Err(BrokerError::Timeout("orders query".to_string()));
        }
        let orders = match filter {
            OrderFilter::Working => state
                .orders
                .iter()
                .filter(|o| o.status.is_working())
                .cloned()
                .collect(),
            OrderFilter::All => state.orders.clone(),
        };
        Ok(orders)
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, BrokerError> {
        let mut state = self.state.lock();
        state.calls.push(format!("submit_order:{}", order.symbol));

        if let Some(kind) = state.reject_next_submit.take() {
            return Err(match kind {
                BrokerErrorKind::Transient => BrokerError::Timeout("submit".to_string()),
                BrokerErrorKind::Permanent => BrokerError::Api {
                    status: 422,
                    message: "order rejected".to_string(),
                },
            });
        }

        // A sell-to-open consumes collateral immediately, so later
        // revalidations inside the same cycle observe reduced buying power.
        if order.side == OrderSide::SellToOpen {
            if let (Some(account), Some(strike)) =
                (state.account.as_mut(), occ_strike_of(&order.symbol))
            {
                let collateral = strike * Decimal::from(100) * Decimal::from(order.quantity);
                account.buying_power -= collateral;
                account.options_buying_power -= collateral;
            }
        }

        state.next_order_seq += 1;
        let order_id = format!("mock-order-{}", state.next_order_seq);
        state.orders.push(OpenOrder {
            order_id: order_id.clone(),
            symbol: order.symbol.clone(),
            status: OrderStatus::Open,
            side: order.side,
            quantity: Decimal::from(order.quantity),
            limit_price: Some(order.limit_price),
        });
        state.submitted.push(order);

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Open,
        })
    }
}
