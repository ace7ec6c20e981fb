// ===============================
// src/infer.rs
// ===============================
//
// Protective-level inference for the polled variant: the snapshot feed has
// no explicit TP/SL fields, so they are implied by the resting orders that
// would close the position.

use rust_decimal::Decimal;

use crate::domain::{OrderKind, Side, WorkingOrder};

/// Implied (take-profit, stop-loss) for a position against its working-order
/// set. Candidates on the wrong side of the average are tolerated as a
/// fallback: a stale snapshot can show a protective order that has not
/// crossed the average yet.
pub fn protective_levels(
    signed_qty: Decimal,
    avg: Decimal,
    orders: &[WorkingOrder],
) -> (Option<Decimal>, Option<Decimal>) {
    if orders.is_empty() || signed_qty.is_zero() {
        return (None, None);
    }
    let closing = if signed_qty > Decimal::ZERO { Side::Sell } else { Side::Buy };

    let limits: Vec<Decimal> = orders
        .iter()
        .filter(|o| o.side == Some(closing) && o.kind == OrderKind::Limit)
        .filter_map(|o| o.limit)
        .collect();
    let stops: Vec<Decimal> = orders
        .iter()
        .filter(|o| o.side == Some(closing) && o.kind == OrderKind::Stop)
        .filter_map(|o| o.stop)
        .collect();

    if signed_qty > Decimal::ZERO {
        (
            limits.iter().copied().filter(|p| *p >= avg).min()
                .or_else(|| limits.iter().copied().max()),
            stops.iter().copied().filter(|p| *p < avg).max()
                .or_else(|| stops.iter().copied().min()),
        )
    } else {
        (
            limits.iter().copied().filter(|p| *p <= avg).max()
                .or_else(|| limits.iter().copied().min()),
            stops.iter().copied().filter(|p| *p > avg).min()
                .or_else(|| stops.iter().copied().max()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit(side: Side, px: Decimal) -> WorkingOrder {
        WorkingOrder { kind: OrderKind::Limit, side: Some(side), limit: Some(px), stop: None }
    }

    fn stop(side: Side, px: Decimal) -> WorkingOrder {
        WorkingOrder { kind: OrderKind::Stop, side: Some(side), limit: None, stop: Some(px) }
    }

    #[test]
    fn test_long_position_reads_sell_orders() {
        let orders = [limit(Side::Sell, dec!(110)), stop(Side::Sell, dec!(95))];
        let (tp, sl) = protective_levels(dec!(5), dec!(100), &orders);
        assert_eq!(tp, Some(dec!(110)));
        assert_eq!(sl, Some(dec!(95)));
    }

    #[test]
    fn test_short_position_reads_buy_orders() {
        let orders = [limit(Side::Buy, dec!(90)), stop(Side::Buy, dec!(105))];
        let (tp, sl) = protective_levels(dec!(-5), dec!(100), &orders);
        assert_eq!(tp, Some(dec!(90)));
        assert_eq!(sl, Some(dec!(105)));
    }

    #[test]
    fn test_nearest_candidate_wins() {
        let orders = [
            limit(Side::Sell, dec!(110)),
            limit(Side::Sell, dec!(120)),
            stop(Side::Sell, dec!(90)),
            stop(Side::Sell, dec!(95)),
        ];
        let (tp, sl) = protective_levels(dec!(5), dec!(100), &orders);
        assert_eq!(tp, Some(dec!(110)));
        assert_eq!(sl, Some(dec!(95)));
    }

    #[test]
    fn test_wrong_side_of_average_still_resolves() {
        // stale snapshot: the sell limit has already crossed under the average
        let orders = [limit(Side::Sell, dec!(97)), limit(Side::Sell, dec!(98))];
        let (tp, sl) = protective_levels(dec!(5), dec!(100), &orders);
        assert_eq!(tp, Some(dec!(98)));
        assert_eq!(sl, None);
    }

    #[test]
    fn test_opening_side_orders_are_ignored() {
        let orders = [limit(Side::Buy, dec!(99)), stop(Side::Buy, dec!(101))];
        let (tp, sl) = protective_levels(dec!(5), dec!(100), &orders);
        assert_eq!(tp, None);
        assert_eq!(sl, None);
    }

    #[test]
    fn test_flat_or_empty_book_yields_nothing() {
        assert_eq!(protective_levels(dec!(0), dec!(100), &[limit(Side::Sell, dec!(1))]), (None, None));
        assert_eq!(protective_levels(dec!(5), dec!(100), &[]), (None, None));
    }
}
