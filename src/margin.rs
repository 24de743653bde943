//! Margin rules by instrument and product. Pure logic, invoked on the
//! order-acceptance path and inside the fill transaction.

use crate::config::SandboxConfig;
use crate::models::{round_paise, Action, Product};

/// Exchanges whose symbols are derivative contracts.
const DERIVATIVE_EXCHANGES: [&str; 6] = ["NFO", "BFO", "CDS", "BCD", "MCX", "NCDEX"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Equity,
    Futures,
    OptionContract,
}

/// Classify by exchange segment and symbol suffix. Cash exchanges are
/// equity; on derivative segments options end in CE/PE, everything else is
/// a future.
pub fn classify(symbol: &str, exchange: &str) -> InstrumentKind {
    if !DERIVATIVE_EXCHANGES.contains(&exchange) {
        return InstrumentKind::Equity;
    }
    if symbol.ends_with("CE") || symbol.ends_with("PE") {
        InstrumentKind::OptionContract
    } else {
        InstrumentKind::Futures
    }
}

/// Margin required for `quantity` units at `ref_price` (the LIMIT price
/// when present, else the live LTP).
///
/// Quantity is denominated in units and is already lot-multiple enforced,
/// so an option buy's `premium × quantity` equals premium × lots × lot
/// size.
pub fn margin_required(
    cfg: &SandboxConfig,
    symbol: &str,
    exchange: &str,
    action: Action,
    quantity: u64,
    ref_price: f64,
    product: Product,
) -> f64 {
    let notional = ref_price * quantity as f64;
    let margin = match classify(symbol, exchange) {
        InstrumentKind::Equity => match product {
            Product::Mis => notional / cfg.equity_mis_leverage,
            Product::Cnc | Product::Nrml => notional,
        },
        InstrumentKind::Futures => notional / cfg.futures_leverage,
        InstrumentKind::OptionContract => match action {
            Action::Buy => notional,
            Action::Sell => notional / cfg.option_sell_leverage,
        },
    };
    round_paise(margin)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SandboxConfig {
        SandboxConfig::default()
    }

    #[test]
    fn cash_exchanges_are_equity() {
        assert_eq!(classify("SBIN", "NSE"), InstrumentKind::Equity);
        assert_eq!(classify("500112", "BSE"), InstrumentKind::Equity);
    }

    #[test]
    fn derivative_segment_splits_options_and_futures() {
        assert_eq!(
            classify("NIFTY25AUG24000CE", "NFO"),
            InstrumentKind::OptionContract
        );
        assert_eq!(
            classify("NIFTY25AUG24000PE", "NFO"),
            InstrumentKind::OptionContract
        );
        assert_eq!(classify("NIFTY25AUGFUT", "NFO"), InstrumentKind::Futures);
        assert_eq!(classify("GOLD25AUGFUT", "MCX"), InstrumentKind::Futures);
    }

    #[test]
    fn equity_mis_is_leveraged_cnc_is_full() {
        // 100 × 2500 = 250,000 notional; MIS at 5x → 50,000.
        let mis = margin_required(&cfg(), "RELIANCE", "NSE", Action::Buy, 100, 2500.0, Product::Mis);
        assert_eq!(mis, 50_000.0);

        let cnc = margin_required(&cfg(), "RELIANCE", "NSE", Action::Buy, 100, 2500.0, Product::Cnc);
        assert_eq!(cnc, 250_000.0);
    }

    #[test]
    fn futures_use_futures_leverage() {
        let m = margin_required(
            &cfg(),
            "NIFTY25AUGFUT",
            "NFO",
            Action::Buy,
            75,
            24_000.0,
            Product::Nrml,
        );
        assert_eq!(m, 180_000.0);
    }

    #[test]
    fn option_buy_blocks_full_premium_sell_is_leveraged() {
        let buy = margin_required(
            &cfg(),
            "NIFTY25AUG24000CE",
            "NFO",
            Action::Buy,
            75,
            120.0,
            Product::Nrml,
        );
        assert_eq!(buy, 9000.0);

        let sell = margin_required(
            &cfg(),
            "NIFTY25AUG24000CE",
            "NFO",
            Action::Sell,
            75,
            120.0,
            Product::Nrml,
        );
        assert_eq!(sell, 900.0);
    }

    #[test]
    fn margin_rounds_to_paise() {
        let m = margin_required(&cfg(), "SBIN", "NSE", Action::Buy, 3, 812.505, Product::Mis);
        assert_eq!(m, round_paise(3.0 * 812.505 / 5.0));
    }
}
