//! Position netting: combining a fill with an existing position into a
//! single signed quantity and average price. Pure logic; the store applies
//! the outcome inside the fill transaction.

use crate::models::{round_paise, Action};

/// Result of netting one fill against an existing position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NettingOutcome {
    pub new_qty: i64,
    pub new_avg: f64,
    /// P&L realized by the reducing part (signed).
    pub realized: f64,
    /// Share of the position's blocked margin released by the reduction.
    pub margin_released: f64,
    /// Signed residual opened on the opposite side when crossing zero, or
    /// the full signed delta when opening/adding. Zero for pure reductions.
    pub opened_qty: i64,
    /// Price at which the opened part was established (the fill price).
    pub opened_price: f64,
}

/// Net a fill of `quantity` at `fill_price` against (`old_qty`, `old_avg`)
/// with `old_margin` blocked.
///
/// - Same side (or flat): adds, average re-weighted.
/// - Opposite side within the position: reduces, realizing
///   `(fill - avg) * qty` sign-aware, releasing margin proportionally,
///   average unchanged.
/// - Opposite side beyond the position: closes to zero, then opens the
///   residual at the fill price.
pub fn apply(
    old_qty: i64,
    old_avg: f64,
    old_margin: f64,
    action: Action,
    quantity: u64,
    fill_price: f64,
) -> NettingOutcome {
    let delta = action.sign() * quantity as i64;

    // Opening or adding on the same side.
    if old_qty == 0 || old_qty.signum() == delta.signum() {
        let new_qty = old_qty + delta;
        let new_avg = if new_qty == 0 {
            fill_price
        } else {
            (old_avg * old_qty.abs() as f64 + fill_price * delta.abs() as f64)
                / new_qty.abs() as f64
        };
        return NettingOutcome {
            new_qty,
            new_avg,
            realized: 0.0,
            margin_released: 0.0,
            opened_qty: delta,
            opened_price: fill_price,
        };
    }

    // Reducing (and possibly crossing).
    let reduce_qty = quantity.min(old_qty.unsigned_abs());
    let direction = old_qty.signum() as f64;
    let realized = round_paise((fill_price - old_avg) * reduce_qty as f64 * direction);
    let released = if old_qty.unsigned_abs() == reduce_qty {
        old_margin
    } else {
        round_paise(old_margin * reduce_qty as f64 / old_qty.unsigned_abs() as f64)
    };

    let residual = quantity - reduce_qty;
    if residual == 0 {
        let new_qty = old_qty + delta;
        return NettingOutcome {
            new_qty,
            // Average is unchanged by a reduction; a fully closed row keeps
            // its last average for the day's record.
            new_avg: old_avg,
            realized,
            margin_released: released,
            opened_qty: 0,
            opened_price: fill_price,
        };
    }

    // Crossing: close to zero, open the residual on the opposite side.
    let opened = action.sign() * residual as i64;
    NettingOutcome {
        new_qty: opened,
        new_avg: fill_price,
        realized,
        margin_released: released,
        opened_qty: opened,
        opened_price: fill_price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_long_from_flat() {
        let out = apply(0, 0.0, 0.0, Action::Buy, 100, 2500.0);
        assert_eq!(out.new_qty, 100);
        assert_eq!(out.new_avg, 2500.0);
        assert_eq!(out.realized, 0.0);
        assert_eq!(out.opened_qty, 100);
    }

    #[test]
    fn adding_reweights_average() {
        let out = apply(100, 2500.0, 50_000.0, Action::Buy, 100, 2600.0);
        assert_eq!(out.new_qty, 200);
        assert_eq!(out.new_avg, 2550.0);
        assert_eq!(out.realized, 0.0);
        assert_eq!(out.margin_released, 0.0);
    }

    #[test]
    fn reducing_long_realizes_and_releases_proportionally() {
        let out = apply(100, 2500.0, 50_000.0, Action::Sell, 40, 2600.0);
        assert_eq!(out.new_qty, 60);
        assert_eq!(out.new_avg, 2500.0);
        assert_eq!(out.realized, 4000.0);
        assert_eq!(out.margin_released, 20_000.0);
        assert_eq!(out.opened_qty, 0);
    }

    #[test]
    fn closing_long_at_loss() {
        let out = apply(50, 1000.0, 10_000.0, Action::Sell, 50, 989.0);
        assert_eq!(out.new_qty, 0);
        assert_eq!(out.realized, -550.0);
        assert_eq!(out.margin_released, 10_000.0);
    }

    #[test]
    fn short_positions_realize_sign_aware() {
        // Short 100 @ 500; buy back 100 @ 480 → profit 2000.
        let out = apply(-100, 500.0, 10_000.0, Action::Buy, 100, 480.0);
        assert_eq!(out.new_qty, 0);
        assert_eq!(out.realized, 2000.0);

        // Short 100 @ 500; buy back @ 520 → loss 2000.
        let out = apply(-100, 500.0, 10_000.0, Action::Buy, 100, 520.0);
        assert_eq!(out.realized, -2000.0);
    }

    #[test]
    fn crossing_splits_into_close_and_open() {
        // Long 50 @ 1000; sell 80 @ 1010: close 50 (+500), open short 30 @ 1010.
        let out = apply(50, 1000.0, 10_000.0, Action::Sell, 80, 1010.0);
        assert_eq!(out.new_qty, -30);
        assert_eq!(out.new_avg, 1010.0);
        assert_eq!(out.realized, 500.0);
        assert_eq!(out.margin_released, 10_000.0);
        assert_eq!(out.opened_qty, -30);
    }

    #[test]
    fn open_then_close_at_same_price_is_flat() {
        let open = apply(0, 0.0, 0.0, Action::Buy, 10, 100.0);
        let close = apply(open.new_qty, open.new_avg, 1000.0, Action::Sell, 10, 100.0);
        assert_eq!(close.new_qty, 0);
        assert_eq!(close.realized, 0.0);
        assert_eq!(close.margin_released, 1000.0);
    }
}
