// =============================================================================
// Exchange Adapter — normalized market-data + order-placement interface
// =============================================================================
//
// A single trading venue (spot/margin/futures) is exposed to the rest of the
// service through the `ExchangeAdapter` trait rather than a concrete client
// type, so the bot engine, strategy evaluation, and autonomous controller
// depend only on the contract. `BinanceAdapter` is the sole implementation.

pub mod binance;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FleetError};

/// Buy or sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Asset class a bot trades under. Distinct from the engine-wide kill-switch
/// concept the teacher calls `TradingMode` — this one is per-bot and fixed at
/// creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingMode {
    Spot,
    Margin,
    Futures,
}

impl TradingMode {
    /// Whether this mode permits opening a SHORT position.
    pub fn can_short(&self) -> bool {
        !matches!(self, TradingMode::Spot)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Spot => write!(f, "SPOT"),
            TradingMode::Margin => write!(f, "MARGIN"),
            TradingMode::Futures => write!(f, "FUTURES"),
        }
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub taker_buy_volume: f64,
    pub taker_buy_quote_volume: f64,
    pub is_closed: bool,
}

/// A single fill within an order acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub qty: f64,
    pub quote_qty: f64,
    pub price: f64,
    /// Exchange-reported fee on this fill, if the venue returns one.
    /// Supersedes the service-wide `FEE_RATE` constant when present.
    pub fee: Option<f64>,
}

/// Result of a successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub fills: Vec<Fill>,
    pub ts: i64,
}

impl OrderAck {
    /// Volume-weighted average execution price across all fills.
    pub fn vwap(&self) -> f64 {
        let total_quote: f64 = self.fills.iter().map(|f| f.quote_qty).sum();
        let total_qty: f64 = self.fills.iter().map(|f| f.qty).sum();
        if total_qty <= 0.0 {
            return 0.0;
        }
        total_quote / total_qty
    }

    pub fn total_qty(&self) -> f64 {
        self.fills.iter().map(|f| f.qty).sum()
    }

    /// Effective fee rate for this fill group, as a fraction of notional, if
    /// the venue reported an explicit fee on at least one fill. Supersedes
    /// the service-wide `FEE_RATE` constant when present (spec §9 Open
    /// Question: "exchange-reported fees should supersede if available").
    pub fn effective_fee_rate(&self) -> Option<f64> {
        let total_fee: f64 = self.fills.iter().filter_map(|f| f.fee).sum();
        let reported = self.fills.iter().any(|f| f.fee.is_some());
        if !reported {
            return None;
        }
        let total_quote: f64 = self.fills.iter().map(|f| f.quote_qty).sum();
        if total_quote <= 0.0 {
            return None;
        }
        Some(total_fee / total_quote)
    }
}

/// 24-hour ticker statistics used by the autonomous controller's scan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats24h {
    pub volume_quote: f64,
    pub price_change_pct: f64,
}

/// Normalized market-data + order-placement interface over a venue.
///
/// Policy (spec §4.1): reads are idempotent; writes are not retried
/// internally — the caller decides whether to retry a failed
/// `place_market_order`. Transient failures (`ErrRateLimited`, `ErrNetwork`)
/// are retried with backoff *inside* the adapter before surfacing to the
/// caller, per §7's propagation policy.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<f64, FleetError>;

    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, FleetError>;

    async fn get_balance(&self, asset: &str, mode: TradingMode) -> Result<f64, FleetError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        mode: TradingMode,
    ) -> Result<OrderAck, FleetError>;

    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, FleetError>;

    async fn list_tradable_symbols(&self, quote: &str) -> Result<Vec<String>, FleetError>;
}

/// Map a raw adapter failure reason into the taxonomy's error kind. Adapters
/// call this at their single translation boundary rather than scattering
/// `ErrorKind` construction through every HTTP call site.
pub(crate) fn classify_http_status(status: reqwest::StatusCode, body: &serde_json::Value) -> ErrorKind {
    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    match (status.as_u16(), code) {
        (401, _) | (_, -2014) | (_, -2015) => ErrorKind::Auth,
        (429, _) | (418, _) => ErrorKind::RateLimited,
        (_, -1121) => ErrorKind::SymbolUnsupported,
        (_, -2010) => ErrorKind::InsufficientBalance,
        (400..=499, _) => ErrorKind::SymbolUnsupported,
        _ => ErrorKind::Network,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vwap_averages_multiple_fills_by_notional() {
        let ack = OrderAck {
            order_id: "1".into(),
            fills: vec![
                Fill { qty: 1.0, quote_qty: 100.0, price: 100.0, fee: None },
                Fill { qty: 1.0, quote_qty: 102.0, price: 102.0, fee: None },
            ],
            ts: 0,
        };
        assert!((ack.vwap() - 101.0).abs() < 1e-9);
    }

    #[test]
    fn effective_fee_rate_is_none_when_venue_reports_no_fee() {
        let ack = OrderAck {
            order_id: "1".into(),
            fills: vec![Fill { qty: 1.0, quote_qty: 100.0, price: 100.0, fee: None }],
            ts: 0,
        };
        assert_eq!(ack.effective_fee_rate(), None);
    }

    #[test]
    fn effective_fee_rate_supersedes_the_default_when_reported() {
        let ack = OrderAck {
            order_id: "1".into(),
            fills: vec![Fill { qty: 1.0, quote_qty: 100.0, price: 100.0, fee: Some(0.1) }],
            ts: 0,
        };
        assert!((ack.effective_fee_rate().unwrap() - 0.001).abs() < 1e-9);
    }
}
