//! The nine-stage filtering pipeline. Stages 1, 2, 3 and 7 run during
//! SCAN against quotes, bars and option chains; stages 4, 5, 6, 8 and 9
//! run during EXECUTE against live broker state. Every stage either
//! passes a candidate or blocks it with a structured reason, and any
//! failure inside a stage's data source blocks the candidate; a broken
//! fetch must never read as a pass.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::{AccountSnapshot, Broker, DataFeed};
use crate::chain_selector::{rank_opportunities, ChainSelector};
use crate::config::StrategyConfig;
use crate::context::CycleContext;
use crate::gap_risk::{self, GapStats};
use crate::model::{AssetClass, Opportunity, OptionRight, Underlying, WheelPhase};
use crate::position_guard::PositionGuard;
use crate::wheel_state::{self, WheelOp};

/// Days of history fetched for the gap/volatility stats.
const HISTORY_DAYS: i64 = 120;

/// A candidate stopped at some stage, with the reason the stage reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReason {
    pub stage: u8,
    pub reason: String,
}

impl BlockReason {
    fn new(stage: u8, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }

    fn detection_error(stage: u8) -> Self {
        Self::new(stage, format!("stage_{}_detection_error", stage))
    }

    /// Resource exhaustion is a normal outcome, not a defect; the executor
    /// counts these as skips rather than failures.
    pub fn is_skip(&self) -> bool {
        self.reason == "insufficient_buying_power"
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}: {}", self.stage, self.reason)
    }
}

pub struct ScanSummary {
    /// Globally ranked across all underlyings (score desc, mid desc, dte asc).
    pub opportunities: Vec<Opportunity>,
    pub symbols_evaluated: usize,
    pub blocked: Vec<(String, BlockReason)>,
}

impl ScanSummary {
    pub fn put_count(&self) -> usize {
        self.opportunities
            .iter()
            .filter(|o| o.contract.right == OptionRight::Put)
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.opportunities
            .iter()
            .filter(|o| o.contract.right == OptionRight::Call)
            .count()
    }
}

/// What the execute stages learned about an opportunity that passed 4-6.
#[derive(Debug)]
pub struct ExecutionClearance {
    pub phase: WheelPhase,
    pub open_option_positions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    pub contracts: u32,
    pub collateral: Decimal,
}

pub struct PipelineEngine {
    broker: Arc<dyn Broker>,
    guard: PositionGuard,
    selector: ChainSelector,
    cfg: StrategyConfig,
    feed: DataFeed,
    ctx: CycleContext,
}

impl PipelineEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        cfg: StrategyConfig,
        feed: DataFeed,
        ctx: CycleContext,
    ) -> Self {
        Self {
            guard: PositionGuard::new(broker.clone()),
            selector: ChainSelector::from_config(&cfg),
            broker,
            cfg,
            feed,
            ctx,
        }
    }

    // --- SCAN: stages 1, 2, 3, 7 ---

    pub async fn run_scan(&self) -> ScanSummary {
        let mut blocked = Vec::new();
        let mut survivors: Vec<(Underlying, GapStats)> = Vec::new();

        // Cost bases of held stock decide which underlyings scan for calls
        // instead of puts. A failed position fetch conservatively scans
        // puts only.
        let positions = match self.broker.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "position fetch failed at scan entry, scanning puts only");
                Vec::new()
            }
        };

        for symbol in &self.cfg.universe {
            match self.scan_underlying(symbol).await {
                Ok(entry) => survivors.push(entry),
                Err(block) => {
                    info!(symbol = %symbol, stage = block.stage, reason = %block.reason, "scan blocked");
                    blocked.push((symbol.clone(), block));
                }
            }
        }

        // Stage 3: evaluation cap, ranked by gap-risk score (safest first)
        if let Some(cap) = self.cfg.evaluation_cap() {
            survivors.sort_by(|a, b| {
                b.1.score
                    .partial_cmp(&a.1.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if survivors.len() > cap {
                for (underlying, _) in survivors.drain(cap..) {
                    blocked.push((
                        underlying.symbol,
                        BlockReason::new(3, "evaluation_cap_reached"),
                    ));
                }
            }
        }

        // Stage 7: option chain selection per surviving underlying
        let mut opportunities = Vec::new();
        for (underlying, _) in &survivors {
            let chain = match self.broker.get_option_chain(&underlying.symbol).await {
                Ok(chain) => chain,
                Err(e) => {
                    warn!(symbol = %underlying.symbol, error = %e, "chain fetch failed");
                    blocked.push((underlying.symbol.clone(), BlockReason::detection_error(7)));
                    continue;
                }
            };

            let cost_basis = positions
                .iter()
                .find(|p| {
                    p.asset_class == AssetClass::Equity
                        && p.symbol == underlying.symbol
                        && p.quantity > Decimal::ZERO
                })
                .map(|p| p.entry_price);

            let selection = match cost_basis {
                Some(basis) => self.selector.select_calls(&underlying.symbol, &chain, basis),
                None => self.selector.select_puts(&underlying.symbol, &chain),
            };
            opportunities.extend(selection.opportunities);
        }

        rank_opportunities(&mut opportunities);

        ScanSummary {
            opportunities,
            symbols_evaluated: self.cfg.universe.len(),
            blocked,
        }
    }

    /// Stages 1 and 2 for one symbol.
    async fn scan_underlying(&self, symbol: &str) -> Result<(Underlying, GapStats), BlockReason> {
        // Stage 1a: price bounds from the live quote
        let quote = self
            .broker
            .get_quote(symbol, self.feed)
            .await
            .map_err(|e| {
                warn!(symbol, error = %e, "quote fetch failed");
                BlockReason::detection_error(1)
            })?;

        if quote.last < self.cfg.min_stock_price {
            return Err(BlockReason::new(1, "price_below_minimum"));
        }
        if quote.last > self.cfg.max_stock_price {
            return Err(BlockReason::new(1, "price_above_maximum"));
        }

        // Daily bars feed both the Stage 1 volume floor and the Stage 2
        // gap stats; a broken series blocks at Stage 2.
        let now = self.ctx.time.now();
        let bars = self
            .broker
            .get_bars(symbol, now - Duration::days(HISTORY_DAYS), now, self.feed)
            .await
            .map_err(|e| {
                warn!(symbol, error = %e, "bar fetch failed");
                BlockReason::detection_error(2)
            })?;

        let stats = gap_risk::analyze_bars(&bars, self.cfg.max_overnight_gap_percent)
            .map_err(|e| {
                warn!(symbol, error = %e, "gap analysis failed");
                BlockReason::detection_error(2)
            })?;

        // Stage 1b: liquidity floor
        let avg_volume =
            bars.iter().map(|b| b.volume).sum::<u64>() / bars.len().max(1) as u64;
        if avg_volume < self.cfg.min_avg_volume {
            return Err(BlockReason::new(1, "volume_below_minimum"));
        }

        // Stage 2: historical gap thresholds
        if let Some(reason) = gap_risk::historical_block_reason(
            &stats,
            self.cfg.max_gap_freq,
            self.cfg.max_historical_volatility,
            self.cfg.max_overnight_gap_percent,
        ) {
            return Err(BlockReason::new(2, reason));
        }

        Ok((
            Underlying {
                symbol: symbol.to_string(),
                price: quote.last,
                avg_volume,
                historical_volatility: stats.volatility,
            },
            stats,
        ))
    }

    // --- EXECUTE: stages 4, 5, 6 ---

    /// Clear one stored opportunity against live broker state. The
    /// `in_cycle` set holds underlyings already selected this cycle and is
    /// consulted by the guard's first tier.
    pub async fn clear_for_execution(
        &self,
        opp: &Opportunity,
        in_cycle: &HashSet<String>,
    ) -> Result<ExecutionClearance, BlockReason> {
        let underlying = opp.underlying();

        // Stage 4: real-time gap against the prior close
        let quote = self
            .broker
            .get_quote(underlying, self.feed)
            .await
            .map_err(|e| {
                warn!(underlying, error = %e, "execution quote fetch failed");
                BlockReason::detection_error(4)
            })?;
        let gap = gap_risk::execution_gap(&quote).map_err(|e| {
            warn!(underlying, error = %e, "execution gap computation failed");
            BlockReason::detection_error(4)
        })?;
        if gap > self.cfg.execution_gap_threshold {
            return Err(BlockReason::new(4, "execution_gap_exceeded"));
        }

        // Stage 5: wheel phase admissibility
        let positions = self
            .broker
            .get_positions()
            .await
            .map_err(|e| {
                warn!(underlying, error = %e, "position fetch failed at stage 5");
                BlockReason::detection_error(5)
            })?;

        if let Some(violation) = wheel_state::phase_invariant_violation(underlying, &positions) {
            error!(underlying, %violation, "wheel invariant violated, blocking");
            return Err(BlockReason::new(5, "phase_invariant_violation"));
        }

        let phase = wheel_state::derive_phase(underlying, &positions);
        let op = match opp.contract.right {
            OptionRight::Put => WheelOp::SellPut,
            OptionRight::Call => WheelOp::SellCall,
        };
        if !wheel_state::is_admissible(op, phase) {
            return Err(BlockReason::new(5, "phase_inadmissible"));
        }

        let open_option_positions = positions
            .iter()
            .filter(|p| p.asset_class == AssetClass::Option)
            .count();

        // Stage 6: duplicate guard (in-cycle set, working orders, positions)
        if let Some(conflict) = self.guard.check(underlying, in_cycle).await {
            return Err(BlockReason::new(6, conflict.as_str()));
        }

        Ok(ExecutionClearance {
            phase,
            open_option_positions,
        })
    }

    // --- EXECUTE: stage 8 ---

    /// Size the position against a live account snapshot. Contracts are
    /// capped by per-ticker exposure; buying power is a check, never an
    /// input to the size, since a downsized order would defeat the skip
    /// accounting the revalidation loop depends on.
    pub fn size_position(
        &self,
        opp: &Opportunity,
        account: &AccountSnapshot,
        open_option_positions: usize,
        selected_this_cycle: usize,
    ) -> Result<Sizing, BlockReason> {
        let per_contract = opp.contract.strike * Decimal::from(100);
        if per_contract <= Decimal::ZERO {
            return Err(BlockReason::detection_error(8));
        }

        if open_option_positions + selected_this_cycle >= self.cfg.max_total_positions {
            return Err(BlockReason::new(8, "max_total_positions_reached"));
        }

        let contracts = (self.cfg.max_exposure_per_ticker / per_contract)
            .floor()
            .to_u32()
            .unwrap_or(0);
        if contracts == 0 {
            return Err(BlockReason::new(8, "exceeds_ticker_exposure"));
        }

        let collateral = per_contract * Decimal::from(contracts);
        if collateral > account.options_buying_power {
            return Err(BlockReason::new(8, "insufficient_buying_power"));
        }

        let portfolio_value = account.portfolio_value;
        if portfolio_value > Decimal::ZERO {
            let allocated = portfolio_value - account.options_buying_power + collateral;
            let allocation_after = (allocated / portfolio_value).to_f64().unwrap_or(1.0);
            if allocation_after > self.cfg.max_portfolio_allocation {
                return Err(BlockReason::new(8, "portfolio_allocation_exceeded"));
            }
        }

        Ok(Sizing {
            contracts,
            collateral,
        })
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::broker::{Bar, Quote};
    use crate::context::CycleContext;
    use crate::model::{OpenOrder, OptionContract, OrderSide, OrderStatus, Position};
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn scan_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 3, 14, 30, 0).unwrap()
    }

    fn quote(last: Decimal, prev_close: Decimal) -> Quote {
        Quote {
            bid: last - dec!(0.05),
            ask: last + dec!(0.05),
            last,
            prev_close,
            timestamp: scan_time(),
        }
    }

    fn flat_bars(close: Decimal, volume: u64, len: usize) -> Vec<Bar> {
        (0..len as i64)
            .map(|d| Bar {
                open: close,
                high: close,
                low: close,
                close,
                volume,
                timestamp: scan_time() - chrono::Duration::days(len as i64 - d),
            })
            .collect()
    }

    fn put_contract() -> OptionContract {
        OptionContract {
            occ_symbol: "AMD260807P00145000".to_string(),
            underlying: "AMD".to_string(),
            right: OptionRight::Put,
            strike: dec!(145),
            expiration: NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
            dte: 7,
            bid: dec!(1.50),
            ask: dec!(1.60),
            mid: dec!(1.55),
            delta: -0.18,
            open_interest: 500,
            volume: 100,
        }
    }

    fn opportunity() -> Opportunity {
        Opportunity {
            contract: put_contract(),
            score: 0.46,
            annual_return_estimate: 0.56,
            expected_premium: dec!(155),
        }
    }

    fn account(bp: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            buying_power: bp,
            options_buying_power: bp,
            cash: bp,
            portfolio_value: dec!(100000),
            equity: dec!(100000),
        }
    }

    fn cfg() -> StrategyConfig {
        let mut cfg = StrategyConfig::default();
        cfg.universe = vec!["AMD".to_string()];
        cfg.min_avg_volume = 1_000_000;
        cfg
    }

    fn engine_with(broker: Arc<MockBroker>, cfg: StrategyConfig) -> PipelineEngine {
        PipelineEngine::new(broker, cfg, DataFeed::Iex, CycleContext::simulated(scan_time()))
    }

    fn seed_healthy_amd(broker: &MockBroker) {
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));
        broker.set_bars("AMD", flat_bars(dec!(150), 10_000_000, 60));
        broker.set_chain("AMD", vec![put_contract()]);
    }

    #[tokio::test]
    async fn test_scan_happy_path() {
        let broker = Arc::new(MockBroker::new());
        seed_healthy_amd(&broker);

        let summary = engine_with(broker, cfg()).run_scan().await;
        assert_eq!(summary.opportunities.len(), 1);
        assert_eq!(summary.put_count(), 1);
        assert_eq!(summary.call_count(), 0);
        assert!(summary.blocked.is_empty());
    }

    #[tokio::test]
    async fn test_stage1_price_bounds() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(800), dec!(799)));
        broker.set_bars("AMD", flat_bars(dec!(800), 10_000_000, 60));

        let summary = engine_with(broker, cfg()).run_scan().await;
        assert!(summary.opportunities.is_empty());
        assert_eq!(summary.blocked[0].1.stage, 1);
        assert_eq!(summary.blocked[0].1.reason, "price_above_maximum");
    }

    #[tokio::test]
    async fn test_stage1_volume_floor() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));
        broker.set_bars("AMD", flat_bars(dec!(150), 50_000, 60));

        let summary = engine_with(broker, cfg()).run_scan().await;
        assert_eq!(summary.blocked[0].1.reason, "volume_below_minimum");
    }

    #[tokio::test]
    async fn test_stage2_bar_fault_blocks_conservatively() {
        let mut config = cfg();
        config.universe = vec!["VZ".to_string(), "AMD".to_string()];

        let broker = Arc::new(MockBroker::new());
        seed_healthy_amd(&broker);
        broker.set_quote("VZ", quote(dec!(42), dec!(41.8)));
        broker.fail_bars_for("VZ");

        let summary = engine_with(broker, config).run_scan().await;
        // VZ blocked at stage 2, scan continues with AMD
        let vz = summary.blocked.iter().find(|(s, _)| s == "VZ").unwrap();
        assert_eq!(vz.1.reason, "stage_2_detection_error");
        assert_eq!(summary.opportunities.len(), 1);
    }

    #[tokio::test]
    async fn test_stage3_evaluation_cap() {
        let mut config = cfg();
        config.universe = vec!["AMD".to_string(), "VZ".to_string()];
        config.max_evaluated = Some(1);

        let broker = Arc::new(MockBroker::new());
        seed_healthy_amd(&broker);
        broker.set_quote("VZ", quote(dec!(42), dec!(41.9)));
        // VZ carries a gap event mid-history so AMD ranks safer
        let mut vz_bars = flat_bars(dec!(42), 5_000_000, 60);
        vz_bars[30].open = dec!(46);
        broker.set_bars("VZ", vz_bars);
        broker.set_chain("VZ", vec![]);

        let summary = engine_with(broker, config).run_scan().await;
        let capped = summary
            .blocked
            .iter()
            .find(|(_, b)| b.reason == "evaluation_cap_reached")
            .expect("one symbol capped");
        assert_eq!(capped.0, "VZ");
    }

    #[tokio::test]
    async fn test_scan_sells_calls_when_holding_stock() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));
        broker.set_bars("AMD", flat_bars(dec!(150), 10_000_000, 60));
        broker.add_position(Position {
            symbol: "AMD".to_string(),
            asset_class: AssetClass::Equity,
            quantity: dec!(100),
            entry_price: dec!(145),
            market_value: dec!(15000),
            unrealized_pnl: dec!(500),
        });
        let call = OptionContract {
            occ_symbol: "AMD260807C00150000".to_string(),
            right: OptionRight::Call,
            strike: dec!(150),
            delta: 0.15,
            bid: dec!(0.95),
            ask: dec!(1.05),
            mid: dec!(1.00),
            ..put_contract()
        };
        broker.set_chain("AMD", vec![call, put_contract()]);

        let summary = engine_with(broker, cfg()).run_scan().await;
        assert_eq!(summary.call_count(), 1);
        assert_eq!(summary.put_count(), 0);
    }

    #[tokio::test]
    async fn test_stage4_execution_gap() {
        let broker = Arc::new(MockBroker::new());
        // 5% intraday move with a 2% threshold
        broker.set_quote("AMD", quote(dec!(157.5), dec!(150)));

        let engine = engine_with(broker, cfg());
        let err = engine
            .clear_for_execution(&opportunity(), &HashSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, 4);
        assert_eq!(err.reason, "execution_gap_exceeded");
    }

    #[tokio::test]
    async fn test_stage4_quote_fault_blocks() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_quote_for("AMD");

        let engine = engine_with(broker, cfg());
        let err = engine
            .clear_for_execution(&opportunity(), &HashSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, "stage_4_detection_error");
    }

    #[tokio::test]
    async fn test_stage5_phase_blocks_put_when_holding_stock() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));
        broker.add_position(Position {
            symbol: "AMD".to_string(),
            asset_class: AssetClass::Equity,
            quantity: dec!(100),
            entry_price: dec!(145),
            market_value: dec!(15000),
            unrealized_pnl: dec!(500),
        });

        let engine = engine_with(broker, cfg());
        let err = engine
            .clear_for_execution(&opportunity(), &HashSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, 5);
        assert_eq!(err.reason, "phase_inadmissible");
    }

    #[tokio::test]
    async fn test_stage6_open_order_blocks() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));
        broker.add_order(OpenOrder {
            order_id: "ord-1".to_string(),
            symbol: "AMD260807P00140000".to_string(),
            status: OrderStatus::Open,
            side: OrderSide::SellToOpen,
            quantity: dec!(1),
            limit_price: Some(dec!(1.10)),
        });

        let engine = engine_with(broker, cfg());
        let err = engine
            .clear_for_execution(&opportunity(), &HashSet::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, 6);
        assert_eq!(err.reason, "open_order_exists");
    }

    #[tokio::test]
    async fn test_clearance_passes_when_state_is_clean() {
        let broker = Arc::new(MockBroker::new());
        broker.set_quote("AMD", quote(dec!(150), dec!(149)));

        let engine = engine_with(broker, cfg());
        let clearance = engine
            .clear_for_execution(&opportunity(), &HashSet::new())
            .await
            .expect("cleared");
        assert_eq!(clearance.phase, WheelPhase::Idle);
        assert_eq!(clearance.open_option_positions, 0);
    }

    #[test]
    fn test_stage8_sizing_happy_path() {
        let broker = Arc::new(MockBroker::new());
        let engine = engine_with(broker, cfg());

        let sizing = engine
            .size_position(&opportunity(), &account(dec!(50000)), 0, 0)
            .expect("sized");
        // 25k exposure cap / 14.5k per contract = 1 contract
        assert_eq!(sizing.contracts, 1);
        assert_eq!(sizing.collateral, dec!(14500));
    }

    #[test]
    fn test_stage8_insufficient_buying_power_is_skip() {
        let broker = Arc::new(MockBroker::new());
        let engine = engine_with(broker, cfg());

        let err = engine
            .size_position(&opportunity(), &account(dec!(10000)), 0, 0)
            .unwrap_err();
        assert_eq!(err.reason, "insufficient_buying_power");
        assert!(err.is_skip());
    }

    #[test]
    fn test_stage8_total_position_cap() {
        let broker = Arc::new(MockBroker::new());
        let mut config = cfg();
        config.max_total_positions = 2;
        let engine = engine_with(broker, config);

        let err = engine
            .size_position(&opportunity(), &account(dec!(50000)), 1, 1)
            .unwrap_err();
        assert_eq!(err.reason, "max_total_positions_reached");
    }

    #[test]
    fn test_stage8_portfolio_allocation_cap() {
        let broker = Arc::new(MockBroker::new());
        let mut config = cfg();
        config.max_portfolio_allocation = 0.10;
        let engine = engine_with(broker, config);

        // 14.5k collateral on a 100k portfolio is 14.5% > 10%
        let err = engine
            .size_position(&opportunity(), &account(dec!(100000)), 0, 0)
            .unwrap_err();
        assert_eq!(err.reason, "portfolio_allocation_exceeded");
    }
}
