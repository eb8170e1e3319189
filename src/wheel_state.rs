//! Per-underlying wheel phase, derived from live broker positions on every
//! call. The phase is a pure function of observed state, so the service
//! carries nothing across restarts.

use rust_decimal::Decimal;

use crate::model::{AssetClass, OptionRight, Position, WheelPhase};

/// Operations the strategy can take against one underlying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WheelOp {
    SellPut,
    SellCall,
    ClosePut,
    CloseCall,
}

struct Observed {
    stock: bool,
    short_put: bool,
    short_call: bool,
}

fn observe(underlying: &str, positions: &[Position]) -> Observed {
    let mut observed = Observed {
        stock: false,
        short_put: false,
        short_call: false,
    };
    for p in positions {
        if p.underlying() != underlying {
            continue;
        }
        match p.asset_class {
            AssetClass::Equity => {
                if p.quantity > Decimal::ZERO {
                    observed.stock = true;
                }
            }
            AssetClass::Option => {
                if p.is_short_option() {
                    match p.option_right() {
                        Some(OptionRight::Put) => observed.short_put = true,
                        Some(OptionRight::Call) => observed.short_call = true,
                        None => {}
                    }
                }
            }
        }
    }
    observed
}

/// Derivation rule, checked top to bottom:
/// stock + short call → SELLING_CALLS; stock → HOLDING_STOCK;
/// short put → SELLING_PUTS; otherwise IDLE.
pub fn derive_phase(underlying: &str, positions: &[Position]) -> WheelPhase {
    let observed = observe(underlying, positions);
    if observed.stock && observed.short_call {
        WheelPhase::SellingCalls
    } else if observed.stock {
        WheelPhase::HoldingStock
    } else if observed.short_put {
        WheelPhase::SellingPuts
    } else {
        WheelPhase::Idle
    }
}

/// A broker state no wheel transition can produce: a short put alongside
/// held stock. Reported so the affected underlying can be blocked rather
/// than reconciled.
pub fn phase_invariant_violation(underlying: &str, positions: &[Position]) -> Option<String> {
    let observed = observe(underlying, positions);
    if observed.stock && observed.short_put {
        Some(format!(
            "short put observed for {} while holding stock",
            underlying
        ))
    } else {
        None
    }
}

pub fn is_admissible(op: WheelOp, phase: WheelPhase) -> bool {
    match op {
        WheelOp::SellPut => matches!(phase, WheelPhase::Idle | WheelPhase::SellingPuts),
        WheelOp::SellCall => phase == WheelPhase::HoldingStock,
        WheelOp::ClosePut => phase == WheelPhase::SellingPuts,
        WheelOp::CloseCall => phase == WheelPhase::SellingCalls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn stock(symbol: &str, qty: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Equity,
            quantity: qty,
            entry_price: dec!(145),
            market_value: qty * dec!(145),
            unrealized_pnl: dec!(0),
        }
    }

    fn short_option(occ: &str) -> Position {
        Position {
            symbol: occ.to_string(),
            asset_class: AssetClass::Option,
            quantity: dec!(-1),
            entry_price: dec!(1.55),
            market_value: dec!(-155),
            unrealized_pnl: dec!(0),
        }
    }

    #[test]
    fn test_phase_derivation() {
        assert_eq!(derive_phase("AMD", &[]), WheelPhase::Idle);
        assert_eq!(
            derive_phase("AMD", &[short_option("AMD260807P00145000")]),
            WheelPhase::SellingPuts
        );
        assert_eq!(
            derive_phase("AMD", &[stock("AMD", dec!(100))]),
            WheelPhase::HoldingStock
        );
        assert_eq!(
            derive_phase(
                "AMD",
                &[stock("AMD", dec!(100)), short_option("AMD260807C00155000")]
            ),
            WheelPhase::SellingCalls
        );
    }

    #[test]
    fn test_phase_ignores_other_underlyings() {
        let positions = vec![stock("VZ", dec!(100)), short_option("VZ260807C00042500")];
        assert_eq!(derive_phase("AMD", &positions), WheelPhase::Idle);
        assert_eq!(derive_phase("VZ", &positions), WheelPhase::SellingCalls);
    }

    #[test]
    fn test_phase_derivation_is_pure() {
        let positions = vec![stock("AMD", dec!(100))];
        assert_eq!(
            derive_phase("AMD", &positions),
            derive_phase("AMD", &positions)
        );
    }

    #[test]
    fn test_long_options_do_not_drive_phase() {
        let mut long_put = short_option("AMD260807P00145000");
        long_put.quantity = dec!(1);
        assert_eq!(derive_phase("AMD", &[long_put]), WheelPhase::Idle);
    }

    #[test]
    fn test_admissibility_table() {
        use WheelOp::*;
        use WheelPhase::*;

        assert!(is_admissible(SellPut, Idle));
        assert!(is_admissible(SellPut, SellingPuts));
        assert!(!is_admissible(SellPut, HoldingStock));
        assert!(!is_admissible(SellPut, SellingCalls));

        assert!(is_admissible(SellCall, HoldingStock));
        assert!(!is_admissible(SellCall, Idle));
        assert!(!is_admissible(SellCall, SellingCalls));

        assert!(is_admissible(ClosePut, SellingPuts));
        assert!(!is_admissible(ClosePut, Idle));

        assert!(is_admissible(CloseCall, SellingCalls));
        assert!(!is_admissible(CloseCall, HoldingStock));
    }

    #[test]
    fn test_invariant_violation_detected() {
        let positions = vec![stock("AMD", dec!(100)), short_option("AMD260807P00145000")];
        assert!(phase_invariant_violation("AMD", &positions).is_some());
        assert!(phase_invariant_violation("AMD", &[stock("AMD", dec!(100))]).is_none());
    }
}
