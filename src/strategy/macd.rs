// MACD(12,26,9). No teacher counterpart — written fresh in the idiom of
// `indicators/ema.rs`, layering a signal-line EMA on top of the fast/slow
// EMA spread.

use super::{closes_of, Signal, StrategyOutput};
use crate::candles::require_window;
use crate::error::FleetError;
use crate::exchange::Candle;
use crate::indicators::ema::calculate_ema;

const FAST: usize = 12;
const SLOW: usize = 26;
const SIGNAL: usize = 9;
pub const MIN_WINDOW: usize = SLOW + SIGNAL + 1;

/// MACD line series: `ema_fast - ema_slow`, aligned to the slow series' tail.
fn macd_line(closes: &[f64]) -> Vec<f64> {
    let fast = calculate_ema(closes, FAST);
    let slow = calculate_ema(closes, SLOW);
    let offset = fast.len() - slow.len();
    fast[offset..]
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect()
}

pub fn analyze(window: &[Candle]) -> Result<StrategyOutput, FleetError> {
    let closes = closes_of(window);
    require_window(&closes, MIN_WINDOW)?;

    let macd = macd_line(&closes);
    let signal = calculate_ema(&macd, SIGNAL);
    if signal.len() < 2 {
        return Ok(StrategyOutput::hold("insufficient MACD signal series"));
    }

    let offset = macd.len() - signal.len();
    let macd_prev = macd[offset + signal.len() - 2];
    let macd_now = macd[offset + signal.len() - 1];
    let sig_prev = signal[signal.len() - 2];
    let sig_now = signal[signal.len() - 1];

    let histogram = macd_now - sig_now;
    let scale = macd_now.abs().max(sig_now.abs()).max(1e-9);
    let confidence = (histogram.abs() / scale).min(1.0).max(0.05);

    let out_signal = if macd_prev <= sig_prev && macd_now > sig_now {
        Signal::Buy
    } else if macd_prev >= sig_prev && macd_now < sig_now {
        Signal::Sell
    } else {
        Signal::Hold
    };

    let reason = match out_signal {
        Signal::Buy => "MACD crossed above signal line".to_string(),
        Signal::Sell => "MACD crossed below signal line".to_string(),
        Signal::Hold => "no MACD/signal crossover".to_string(),
    };

    Ok(StrategyOutput {
        signal: out_signal,
        confidence: if out_signal == Signal::Hold { 0.0 } else { confidence },
        reason,
        indicators: serde_json::json!({ "macd": macd_now, "signal": sig_now, "histogram": histogram }),
    })
}
