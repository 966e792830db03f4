// Combined vote across ma_crossover, rsi, and macd — the three strategies
// immediately preceding bollinger_bands in the registry order, consistent
// with the `0.6 + 0.1*k` agreement formula implying a denominator of 3 (see
// DESIGN.md's Open Question decisions). Emits BUY/SELL only on >= 2-of-3
// agreement; otherwise HOLD.

use super::{macd, ma_crossover, rsi, Signal, StrategyOutput};
use crate::error::FleetError;
use crate::exchange::Candle;

pub const MIN_WINDOW: usize = macd::MIN_WINDOW;

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let outputs = [
        ma_crossover::analyze(window)?,
        rsi::analyze(window)?,
        macd::analyze(window)?,
    ];

    let buys = outputs.iter().filter(|o| o.signal == Signal::Buy).count();
    let sells = outputs.iter().filter(|o| o.signal == Signal::Sell).count();

    let (signal, agree) = if buys >= 2 {
        (Signal::Buy, buys)
    } else if sells >= 2 {
        (Signal::Sell, sells)
    } else {
        (Signal::Hold, 0)
    };

    let confidence = if signal == Signal::Hold { 0.0 } else { 0.6 + 0.1 * agree as f64 };

    let reason = match signal {
        Signal::Buy => format!("{agree}/3 strategies agree BUY"),
        Signal::Sell => format!("{agree}/3 strategies agree SELL"),
        Signal::Hold => "no majority agreement".to_string(),
    };

    Ok(StrategyOutput {
        signal,
        confidence,
        reason,
        indicators: serde_json::json!({
            "ma_crossover": outputs[0].signal,
            "rsi": outputs[1].signal,
            "macd": outputs[2].signal,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64,
                close_time: i as i64,
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
                quote_volume: 1.0,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 0.5,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn rejects_short_window() {
        let candles = candles_from(&[1.0, 2.0, 3.0]);
        assert!(analyze(&candles).is_err());
    }

    #[test]
    fn hold_when_no_majority() {
        let closes = vec![100.0; 80];
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        assert_eq!(out.signal, Signal::Hold);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn confidence_formula_matches_agreement_count() {
        let closes: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.15).sin() * 4.0).collect();
        let candles = candles_from(&closes);
        let out = analyze(&candles).unwrap();
        if out.signal != Signal::Hold {
            assert!(out.confidence >= 0.8 && out.confidence <= 0.9);
        }
    }
}
