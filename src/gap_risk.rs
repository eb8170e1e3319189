//! Overnight gap analysis over daily bars. Stage 2 consumes the
//! historical stats; Stage 4 re-checks the live quote at execution time.
//! Every failure path here is an `Err` so the pipeline can map it to a
//! BLOCKED verdict; a bad series must never look like a pass.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::broker::{Bar, Quote};

/// Trading days used to annualize close-to-close volatility.
const TRADING_DAYS_PER_YEAR: f64 = 252.0;
/// Minimum bars required for the historical stats to mean anything.
const MIN_BARS: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct GapStats {
    /// Composite safety score in [0, 1], higher is safer. Used to rank
    /// underlyings when the evaluation cap is active.
    pub score: f64,
    /// Share of sessions whose overnight gap exceeded the event threshold.
    pub frequency: f64,
    /// Annualized close-to-close volatility.
    pub volatility: f64,
    /// Most recent overnight gap, as a fraction of the prior close.
    pub current_gap_percent: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum GapAnalysisError {
    #[error("insufficient history: {0} bars, need {MIN_BARS}")]
    InsufficientHistory(usize),
    #[error("degenerate series: non-positive close")]
    DegenerateSeries,
    #[error("price not representable as f64")]
    NumericOverflow,
}

fn to_f64(value: Decimal) -> Result<f64, GapAnalysisError> {
    value.to_f64().ok_or(GapAnalysisError::NumericOverflow)
}

/// Compute gap statistics from a daily bar series, oldest first.
/// `gap_event_threshold` is the overnight move that counts as a gap event
/// for the frequency estimate.
pub fn analyze_bars(bars: &[Bar], gap_event_threshold: f64) -> Result<GapStats, GapAnalysisError> {
    if bars.len() < MIN_BARS {
        return Err(GapAnalysisError::InsufficientHistory(bars.len()));
    }

    let mut gap_events = 0usize;
    let mut current_gap = 0.0f64;
    let mut returns = Vec::with_capacity(bars.len() - 1);

    for window in bars.windows(2) {
        let prev_close = to_f64(window[0].close)?;
        let open = to_f64(window[1].open)?;
        let close = to_f64(window[1].close)?;
        if prev_close <= 0.0 {
            return Err(GapAnalysisError::DegenerateSeries);
        }

        let gap = ((open - prev_close) / prev_close).abs();
        if gap > gap_event_threshold {
            gap_events += 1;
        }
        current_gap = gap;

        returns.push(close / prev_close - 1.0);
    }

    let frequency = gap_events as f64 / (bars.len() - 1) as f64;
    let volatility = annualized_volatility(&returns);

    let score = (1.0 - frequency).clamp(0.0, 1.0)
        * (1.0 - volatility.clamp(0.0, 1.0))
        * (1.0 - current_gap.clamp(0.0, 1.0));

    Ok(GapStats {
        score,
        frequency,
        volatility,
        current_gap_percent: current_gap,
    })
}

fn annualized_volatility(returns: &[f64]) -> f64 {
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Stage 2 verdict: the first threshold the stats violate, if any.
pub fn historical_block_reason(
    stats: &GapStats,
    max_gap_freq: f64,
    max_historical_volatility: f64,
    max_overnight_gap_percent: f64,
) -> Option<&'static str> {
    if stats.frequency > max_gap_freq {
        return Some("gap_frequency_too_high");
    }
    if stats.volatility > max_historical_volatility {
        return Some("historical_volatility_too_high");
    }
    if stats.current_gap_percent > max_overnight_gap_percent {
        return Some("overnight_gap_too_large");
    }
    None
}

/// Stage 4: intraday move of the live quote against the prior close.
pub fn execution_gap(quote: &Quote) -> Result<f64, GapAnalysisError> {
    let last = to_f64(quote.last)?;
    let prev_close = to_f64(quote.prev_close)?;
    if prev_close <= 0.0 {
        return Err(GapAnalysisError::DegenerateSeries);
    }
    Ok(((last - prev_close) / prev_close).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bar(day: i64, open: Decimal, close: Decimal) -> Bar {
        Bar {
            open,
            high: close + dec!(1),
            low: open - dec!(1),
            close,
            volume: 10_000_000,
            timestamp: Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap() + Duration::days(day),
        }
    }

    /// Flat series: every day opens where the prior day closed.
    fn flat_series(len: usize) -> Vec<Bar> {
        (0..len as i64)
            .map(|d| bar(d, dec!(100), dec!(100)))
            .collect()
    }

    #[test]
    fn test_flat_series_is_riskless() {
        let stats = analyze_bars(&flat_series(30), 0.05).expect("stats");
        assert_eq!(stats.frequency, 0.0);
        assert_eq!(stats.volatility, 0.0);
        assert_eq!(stats.current_gap_percent, 0.0);
        assert!(stats.score > 0.99);
    }

    #[test]
    fn test_gap_events_are_counted() {
        let mut bars = flat_series(30);
        // One 10% overnight gap mid-series
        bars[15].open = dec!(110);
        bars[15].close = dec!(100);
        let stats = analyze_bars(&bars, 0.05).expect("stats");
        assert!((stats.frequency - 1.0 / 29.0).abs() < 1e-9);
    }

    #[test]
    fn test_current_gap_is_last_session() {
        let mut bars = flat_series(30);
        let last = bars.len() - 1;
        bars[last].open = dec!(104);
        let stats = analyze_bars(&bars, 0.05).expect("stats");
        assert!((stats.current_gap_percent - 0.04).abs() < 1e-9);
    }

    #[test]
    fn test_short_series_is_an_error() {
        let err = analyze_bars(&flat_series(5), 0.05).unwrap_err();
        assert_eq!(err, GapAnalysisError::InsufficientHistory(5));
        assert!(analyze_bars(&[], 0.05).is_err());
    }

    #[test]
    fn test_degenerate_close_is_an_error() {
        let mut bars = flat_series(30);
        bars[10].close = dec!(0);
        assert_eq!(
            analyze_bars(&bars, 0.05).unwrap_err(),
            GapAnalysisError::DegenerateSeries
        );
    }

    #[test]
    fn test_historical_block_reasons() {
        let mut stats = GapStats {
            score: 0.9,
            frequency: 0.02,
            volatility: 0.25,
            current_gap_percent: 0.01,
        };
        assert_eq!(historical_block_reason(&stats, 0.10, 0.50, 0.05), None);

        stats.frequency = 0.2;
        assert_eq!(
            historical_block_reason(&stats, 0.10, 0.50, 0.05),
            Some("gap_frequency_too_high")
        );

        stats.frequency = 0.02;
        stats.volatility = 0.8;
        assert_eq!(
            historical_block_reason(&stats, 0.10, 0.50, 0.05),
            Some("historical_volatility_too_high")
        );

        stats.volatility = 0.25;
        stats.current_gap_percent = 0.09;
        assert_eq!(
            historical_block_reason(&stats, 0.10, 0.50, 0.05),
            Some("overnight_gap_too_large")
        );
    }

    #[test]
    fn test_execution_gap() {
        let quote = Quote {
            bid: dec!(149.9),
            ask: dec!(150.1),
            last: dec!(150),
            prev_close: dec!(147),
            timestamp: Utc::now(),
        };
        let gap = execution_gap(&quote).expect("gap");
        assert!((gap - 3.0 / 147.0).abs() < 1e-9);

        let zero_close = Quote {
            prev_close: dec!(0),
            ..quote
        };
        assert_eq!(
            execution_gap(&zero_close).unwrap_err(),
            GapAnalysisError::DegenerateSeries
        );
    }
}
