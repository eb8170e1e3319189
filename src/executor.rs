//! Sequential order submission. Each opportunity in the ranked batch gets
//! its own buying-power revalidation against a fresh account snapshot
//! before its order goes out. Submissions are strictly ordered and never
//! concurrent: sizing a batch against one stale snapshot is how most of a
//! cycle's orders once came back rejected after the first few consumed
//! the margin.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, DataFeed, OrderRequest, TimeInForce};
use crate::context::CycleContext;
use crate::metrics;
use crate::model::{Opportunity, OrderSide};
use crate::pipeline::PipelineEngine;

#[derive(Debug, Default, Clone)]
pub struct ExecutionReport {
    pub opportunities_evaluated: usize,
    pub trades_executed: usize,
    pub trades_failed: usize,
    pub buying_power_start: Decimal,
    pub buying_power_end: Decimal,
}

#[derive(Debug, Default, Clone)]
pub struct MonitorReport {
    pub positions_evaluated: usize,
    pub positions_closed: usize,
    pub errors: usize,
}

pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    pipeline: Arc<PipelineEngine>,
    ctx: CycleContext,
    feed: DataFeed,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn Broker>,
        pipeline: Arc<PipelineEngine>,
        ctx: CycleContext,
        feed: DataFeed,
    ) -> Self {
        Self {
            broker,
            pipeline,
            ctx,
            feed,
        }
    }

    /// Walk the ranked batch in order, submitting at most one order per
    /// underlying. Fails only if the opening account snapshot cannot be
    /// fetched; per-opportunity problems never abort the cycle.
    pub async fn execute_batch(
        &self,
        opportunities: &[Opportunity],
    ) -> Result<ExecutionReport, BrokerError> {
        let start_account = self.broker.get_account().await?;
        let mut report = ExecutionReport {
            buying_power_start: start_account.options_buying_power,
            buying_power_end: start_account.options_buying_power,
            ..Default::default()
        };

        // Underlyings selected this cycle; feeds the guard's first tier.
        let mut in_cycle: HashSet<String> = HashSet::new();
        let cycle_cap = self.pipeline.config().cycle_cap();

        for opp in opportunities {
            // Stage 9: halt once the per-cycle cap is reached
            if let Some(cap) = cycle_cap {
                if report.trades_executed >= cap {
                    info!(cap, "cycle position cap reached, halting batch");
                    break;
                }
            }

            report.opportunities_evaluated += 1;
            let underlying = opp.underlying().to_string();

            // Stages 4-6 against live broker state
            let clearance = match self.pipeline.clear_for_execution(opp, &in_cycle).await {
                Ok(c) => c,
                Err(block) => {
                    info!(underlying = %underlying, stage = block.stage, reason = %block.reason, "blocked");
                    metrics::inc_stage_block(block.stage);
                    continue;
                }
            };

            // Stage 8: revalidate against a fresh snapshot, per order
            let account = match self.broker.get_account().await {
                Ok(a) => a,
                Err(e) => {
                    warn!(underlying = %underlying, error = %e, "account refresh failed, skipping");
                    continue;
                }
            };
            report.buying_power_end = account.options_buying_power;

            let sizing = match self.pipeline.size_position(
                opp,
                &account,
                clearance.open_option_positions,
                report.trades_executed,
            ) {
                Ok(s) => s,
                Err(block) if block.is_skip() => {
                    info!(underlying = %underlying, reason = %block.reason, "skipped");
                    metrics::inc_orders_skipped();
                    continue;
                }
                Err(block) => {
                    info!(underlying = %underlying, stage = block.stage, reason = %block.reason, "blocked");
                    metrics::inc_stage_block(block.stage);
                    continue;
                }
            };

            let request = OrderRequest {
                symbol: opp.contract.occ_symbol.clone(),
                side: OrderSide::SellToOpen,
                quantity: sizing.contracts,
                limit_price: limit_price(opp.contract.mid, self.pipeline.config().slippage_factor),
                time_in_force: TimeInForce::Day,
                client_order_id: self.ctx.id.new_id(),
            };

            info!(
                underlying = %underlying,
                occ_symbol = %request.symbol,
                contracts = sizing.contracts,
                collateral = %sizing.collateral,
                limit_price = %request.limit_price,
                "submitting order"
            );

            // Submission is never retried, transient or not: a timed-out
            // submit may have reached the broker.
            match self.broker.submit_order(request).await {
                Ok(ack) => {
                    info!(underlying = %underlying, order_id = %ack.order_id, "order accepted");
                    metrics::inc_orders_submitted();
                    report.trades_executed += 1;
                    in_cycle.insert(underlying);
                }
                Err(e) => {
                    error!(underlying = %underlying, error = %e, transient = e.is_transient(), "order failed");
                    metrics::inc_orders_failed();
                    report.trades_failed += 1;
                    // Conservatively reserve the underlying anyway: the
                    // broker may have accepted an order we never heard about.
                    in_cycle.insert(underlying);
                }
            }
        }

        if let Ok(account) = self.broker.get_account().await {
            report.buying_power_end = account.options_buying_power;
        }

        Ok(report)
    }

    /// Early-close pass: buy back short options that have captured the
    /// configured share of their premium. Deploys no new capital.
    pub async fn run_monitor(&self) -> MonitorReport {
        let mut report = MonitorReport::default();
        let profit_target = self.pipeline.config().profit_target_percent;

        let positions = match self.broker.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "position fetch failed, monitor pass aborted");
                report.errors += 1;
                return report;
            }
        };

        for position in positions.iter().filter(|p| p.is_short_option()) {
            report.positions_evaluated += 1;

            // A zero entry price (seen after corporate actions) makes the
            // profit computation meaningless: skip, never guess.
            if position.entry_price <= Decimal::ZERO {
                warn!(symbol = %position.symbol, "zero entry price, skipping close evaluation");
                continue;
            }

            let quote = match self.broker.get_quote(&position.symbol, self.feed).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "quote failed during monitor");
                    report.errors += 1;
                    continue;
                }
            };

            let current_mid = quote.mid();
            let profit_pct = ((position.entry_price - current_mid) / position.entry_price)
                .to_f64()
                .unwrap_or(0.0);
            if profit_pct < profit_target {
                continue;
            }

            let contracts = match position.quantity.abs().to_u32() {
                Some(q) if q > 0 => q,
                _ => {
                    warn!(symbol = %position.symbol, quantity = %position.quantity, "unusable quantity");
                    report.errors += 1;
                    continue;
                }
            };

            let request = OrderRequest {
                symbol: position.symbol.clone(),
                side: OrderSide::BuyToClose,
                quantity: contracts,
                limit_price: current_mid.round_dp_with_strategy(
                    2,
                    RoundingStrategy::MidpointAwayFromZero,
                ),
                time_in_force: TimeInForce::Day,
                client_order_id: self.ctx.id.new_id(),
            };

            info!(
                symbol = %request.symbol,
                profit_pct,
                limit_price = %request.limit_price,
                "closing profitable short option"
            );

            match self.broker.submit_order(request).await {
                Ok(_) => {
                    metrics::inc_positions_closed(1);
                    report.positions_closed += 1;
                }
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "close order failed");
                    report.errors += 1;
                }
            }
        }

        report
    }
}

/// Limit price for a sell-to-open: mid shaded down by the slippage factor,
/// rounded to the option tick ($0.01).
pub fn limit_price(mid: Decimal, slippage_factor: f64) -> Decimal {
    let factor = Decimal::ONE
        - Decimal::from_f64(slippage_factor).unwrap_or(Decimal::ZERO);
    (mid * factor).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_limit_price_shading() {
        assert_eq!(limit_price(dec!(1.55), 0.01), dec!(1.53));
        assert_eq!(limit_price(dec!(2.00), 0.01), dec!(1.98));
        assert_eq!(limit_price(dec!(1.55), 0.0), dec!(1.55));
    }

    #[test]
    fn test_limit_price_rounds_to_tick() {
        // 0.333 * 0.99 = 0.32967 -> 0.33
        assert_eq!(limit_price(dec!(0.333), 0.01), dec!(0.33));
    }
}
