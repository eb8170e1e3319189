use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::model::{OptionContract, OptionRight, Opportunity};

/// Why chain contracts were rejected, counted per underlying for the scan
/// log. The histogram is what makes a zero-opportunity scan diagnosable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RejectionHistogram {
    pub rejected_dte_too_high: usize,
    pub rejected_premium_too_low: usize,
    pub rejected_delta_out_of_range: usize,
    pub rejected_no_liquidity: usize,
    pub rejected_below_cost_basis: usize,
    pub rejected_malformed: usize,
}

impl RejectionHistogram {
    pub fn total(&self) -> usize {
        self.rejected_dte_too_high
            + self.rejected_premium_too_low
            + self.rejected_delta_out_of_range
            + self.rejected_no_liquidity
            + self.rejected_below_cost_basis
            + self.rejected_malformed
    }

    pub fn log(&self, underlying: &str, right: OptionRight, selected: usize) {
        info!(
            underlying,
            right = ?right,
            selected,
            rejected_dte_too_high = self.rejected_dte_too_high,
            rejected_premium_too_low = self.rejected_premium_too_low,
            rejected_delta_out_of_range = self.rejected_delta_out_of_range,
            rejected_no_liquidity = self.rejected_no_liquidity,
            rejected_below_cost_basis = self.rejected_below_cost_basis,
            rejected_malformed = self.rejected_malformed,
            "chain selection"
        );
    }
}

pub struct Selection {
    pub opportunities: Vec<Opportunity>,
    pub rejections: RejectionHistogram,
}

enum Reject {
    DteTooHigh,
    PremiumTooLow,
    DeltaOutOfRange,
    NoLiquidity,
    BelowCostBasis,
}

/// Stage 7: strike/delta/DTE/liquidity filtering of a raw option chain,
/// plus the ranking metadata for everything that survives.
pub struct ChainSelector {
    target_dte: i64,
    min_premium: Decimal,
    delta_min: f64,
    delta_max: f64,
    min_open_interest: u64,
}

impl ChainSelector {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            target_dte: cfg.target_dte,
            min_premium: cfg.min_premium,
            delta_min: cfg.delta_min,
            delta_max: cfg.delta_max,
            min_open_interest: cfg.min_open_interest,
        }
    }

    /// Select cash-secured-put candidates from the chain.
    pub fn select_puts(&self, underlying: &str, chain: &[OptionContract]) -> Selection {
        self.select(underlying, chain, OptionRight::Put, None)
    }

    /// Select covered-call candidates. Strikes below the cost basis of the
    /// held stock are excluded so assignment can never lock in a loss.
    pub fn select_calls(
        &self,
        underlying: &str,
        chain: &[OptionContract],
        cost_basis: Decimal,
    ) -> Selection {
        self.select(underlying, chain, OptionRight::Call, Some(cost_basis))
    }

    fn select(
        &self,
        underlying: &str,
        chain: &[OptionContract],
        right: OptionRight,
        cost_basis: Option<Decimal>,
    ) -> Selection {
        let mut rejections = RejectionHistogram::default();
        let mut opportunities = Vec::new();

        for contract in chain.iter().filter(|c| c.right == right) {
            if let Err(e) = contract.validate() {
                debug!(occ_symbol = %contract.occ_symbol, error = %e, "malformed contract");
                rejections.rejected_malformed += 1;
                continue;
            }
            match self.passes(contract, cost_basis) {
                Ok(()) => opportunities.push(self.annotate(contract)),
                Err(Reject::DteTooHigh) => rejections.rejected_dte_too_high += 1,
                Err(Reject::PremiumTooLow) => rejections.rejected_premium_too_low += 1,
                Err(Reject::DeltaOutOfRange) => rejections.rejected_delta_out_of_range += 1,
                Err(Reject::NoLiquidity) => rejections.rejected_no_liquidity += 1,
                Err(Reject::BelowCostBasis) => rejections.rejected_below_cost_basis += 1,
            }
        }

        rank_opportunities(&mut opportunities);
        rejections.log(underlying, right, opportunities.len());

        Selection {
            opportunities,
            rejections,
        }
    }

    fn passes(&self, c: &OptionContract, cost_basis: Option<Decimal>) -> Result<(), Reject> {
        if c.dte > self.target_dte {
            return Err(Reject::DteTooHigh);
        }
        if c.mid < self.min_premium {
            return Err(Reject::PremiumTooLow);
        }
        let abs_delta = c.delta.abs();
        // Boundary inclusive on both sides
        if abs_delta < self.delta_min || abs_delta > self.delta_max {
            return Err(Reject::DeltaOutOfRange);
        }
        if c.open_interest < self.min_open_interest && c.volume == 0 {
            return Err(Reject::NoLiquidity);
        }
        if let Some(basis) = cost_basis {
            if c.strike < basis {
                return Err(Reject::BelowCostBasis);
            }
        }
        Ok(())
    }

    fn annotate(&self, contract: &OptionContract) -> Opportunity {
        let annual_return_estimate = annual_return_estimate(contract);
        Opportunity {
            score: annual_return_estimate * (1.0 - contract.delta.abs()),
            annual_return_estimate,
            expected_premium: contract.mid * Decimal::from(100),
            contract: contract.clone(),
        }
    }
}

/// `(mid / strike) · (365 / dte)`. Same-day expiries are floored to one
/// day so the estimate stays finite.
pub fn annual_return_estimate(contract: &OptionContract) -> f64 {
    let mid = contract.mid.to_f64().unwrap_or(0.0);
    let strike = contract.strike.to_f64().unwrap_or(0.0);
    if strike <= 0.0 {
        return 0.0;
    }
    (mid / strike) * (365.0 / contract.dte.max(1) as f64)
}

/// Deterministic ranking: score descending, then mid descending, then dte
/// ascending. Total over any list of well-formed opportunities.
pub fn rank_opportunities(opportunities: &mut [Opportunity]) {
    opportunities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.contract.mid.cmp(&a.contract.mid))
            .then_with(|| a.contract.dte.cmp(&b.contract.dte))
    });
}
