//! Stage 6: duplicate-position guard. Three tiers, checked in order:
//! the current cycle's selected set, the broker's working orders, and the
//! broker's filled positions. Checking only filled positions is how the
//! service once submitted a second order for an underlying while the first
//! sat unfilled across an hourly cycle; the order tier closes that race.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::broker::{Broker, OrderFilter};
use crate::model::AssetClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    PendingOrderInCycle,
    OpenOrderExists,
    FilledPositionExists,
    QueryFailed,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::PendingOrderInCycle => "pending_order_in_cycle",
            ConflictReason::OpenOrderExists => "open_order_exists",
            ConflictReason::FilledPositionExists => "filled_position_exists",
            ConflictReason::QueryFailed => "position_guard_query_failed",
        }
    }
}

pub struct PositionGuard {
    broker: Arc<dyn Broker>,
}

impl PositionGuard {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Returns the first conflict found for `underlying`, or `None` when a
    /// new order is safe. A failed broker query is a conflict: when the
    /// guard cannot see, it refuses.
    pub async fn check(
        &self,
        underlying: &str,
        in_cycle: &HashSet<String>,
    ) -> Option<ConflictReason> {
        // Tier 1: selected earlier in this cycle
        if in_cycle.contains(underlying) {
            return Some(ConflictReason::PendingOrderInCycle);
        }

        // Tier 2: working orders at the broker
        match self.broker.get_orders(OrderFilter::Working).await {
            Ok(orders) => {
                if orders
                    .iter()
                    .any(|o| o.status.is_working() && o.underlying() == underlying)
                {
                    return Some(ConflictReason::OpenOrderExists);
                }
            }
            Err(e) => {
                warn!(underlying, error = %e, "order query failed, treating as conflict");
                return Some(ConflictReason::QueryFailed);
            }
        }

        // Tier 3: filled option positions at the broker
        match self.broker.get_positions().await {
            Ok(positions) => {
                if positions
                    .iter()
                    .any(|p| p.asset_class == AssetClass::Option && p.underlying() == underlying)
                {
                    return Some(ConflictReason::FilledPositionExists);
                }
            }
            Err(e) => {
                warn!(underlying, error = %e, "position query failed, treating as conflict");
                return Some(ConflictReason::QueryFailed);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockBroker;
    use crate::model::{OpenOrder, OrderSide, OrderStatus, Position};
    use rust_decimal_macros::dec;

    fn guard(broker: Arc<MockBroker>) -> PositionGuard {
        PositionGuard::new(broker)
    }

    fn working_order(symbol: &str, status: OrderStatus) -> OpenOrder {
        OpenOrder {
            order_id: "ord-1".to_string(),
            symbol: symbol.to_string(),
            status,
            side: OrderSide::SellToOpen,
            quantity: dec!(1),
            limit_price: Some(dec!(1.53)),
        }
    }

    fn short_put(occ: &str) -> Position {
        Position {
            symbol: occ.to_string(),
            asset_class: AssetClass::Option,
            quantity: dec!(-1),
            entry_price: dec!(1.55),
            market_value: dec!(-155),
            unrealized_pnl: dec!(0),
        }
    }

    #[tokio::test]
    async fn test_clear_when_no_conflicts() {
        let broker = Arc::new(MockBroker::new());
        assert_eq!(guard(broker).check("AMD", &HashSet::new()).await, None);
    }

    #[tokio::test]
    async fn test_tier1_in_cycle_set() {
        let broker = Arc::new(MockBroker::new());
        let mut in_cycle = HashSet::new();
        in_cycle.insert("AMD".to_string());
        assert_eq!(
            guard(broker).check("AMD", &in_cycle).await,
            Some(ConflictReason::PendingOrderInCycle)
        );
    }

    #[tokio::test]
    async fn test_tier2_open_order_blocks() {
        let broker = Arc::new(MockBroker::new());
        broker.add_order(working_order("AMD260807P00145000", OrderStatus::Open));
        assert_eq!(
            guard(broker).check("AMD", &HashSet::new()).await,
            Some(ConflictReason::OpenOrderExists)
        );
    }

    #[tokio::test]
    async fn test_tier2_pending_new_blocks() {
        let broker = Arc::new(MockBroker::new());
        broker.add_order(working_order("AMD260807P00145000", OrderStatus::PendingNew));
        assert_eq!(
            guard(broker).check("AMD", &HashSet::new()).await,
            Some(ConflictReason::OpenOrderExists)
        );
    }

    #[tokio::test]
    async fn test_tier3_filled_position_blocks() {
        let broker = Arc::new(MockBroker::new());
        broker.add_position(short_put("AMD260807P00145000"));
        assert_eq!(
            guard(broker).check("AMD", &HashSet::new()).await,
            Some(ConflictReason::FilledPositionExists)
        );
    }

    #[tokio::test]
    async fn test_other_underlyings_do_not_block() {
        let broker = Arc::new(MockBroker::new());
        broker.add_order(working_order("VZ260807P00042500", OrderStatus::Open));
        broker.add_position(short_put("VZ260807P00042500"));
        assert_eq!(guard(broker).check("AMD", &HashSet::new()).await, None);
    }

    #[tokio::test]
    async fn test_query_failure_is_a_conflict() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_order_queries(true);
        assert_eq!(
            guard(broker.clone()).check("AMD", &HashSet::new()).await,
            Some(ConflictReason::QueryFailed)
        );

        broker.fail_order_queries(false);
        broker.fail_position_queries(true);
        assert_eq!(
            guard(broker).check("AMD", &HashSet::new()).await,
            Some(ConflictReason::QueryFailed)
        );
    }
}
