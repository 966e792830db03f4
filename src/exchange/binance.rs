// =============================================================================
// Binance Adapter — HMAC-SHA256 signed REST client implementing ExchangeAdapter
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between us and Binance's servers.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use super::{
    classify_http_status, Candle, ExchangeAdapter, Fill, OrderAck, OrderSide, Stats24h,
    TradingMode,
};
use crate::error::{ErrorKind, FleetError};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Request weight charged for a klines call (spec §5 — caller respects the
/// adapter's own backoff; this is what we pre-check against).
const KLINES_WEIGHT: u32 = 2;
/// Maximum retries for a transient (`ErrRateLimited`/`ErrNetwork`) failure on
/// a read operation, per §7's adapter-internal retry policy.
const MAX_READ_RETRIES: u32 = 3;

/// Binance REST API client with HMAC-SHA256 request signing.
pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: RateLimitTracker,
}

impl BinanceAdapter {
    /// Create a new `BinanceAdapter`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `testnet` — when true, targets Binance's spot testnet base URL.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet {
            "https://testnet.binance.vision".to_string()
        } else {
            "https://api.binance.com".to_string()
        };

        debug!(base_url = %base_url, "BinanceAdapter initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
            rate_limit: RateLimitTracker::new(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Issue a GET request with a backoff-and-retry loop for transient
    /// failures, per §7's adapter-internal retry policy for reads.
    async fn get_with_retry(&self, url: &str) -> Result<(reqwest::StatusCode, serde_json::Value), FleetError> {
        let mut attempt = 0u32;
        loop {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| FleetError::new(ErrorKind::Network, e.to_string()))?;

            let status = resp.status();
            self.rate_limit.update_from_headers(resp.headers());

            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| FleetError::new(ErrorKind::Network, e.to_string()))?;

            if status.is_success() {
                return Ok((status, body));
            }

            let kind = classify_http_status(status, &body);
            attempt += 1;
            if kind.is_transient() && attempt < MAX_READ_RETRIES {
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                warn!(%status, attempt, "transient exchange error, retrying after backoff");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let message = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("exchange request failed")
                .to_string();
            return Err(FleetError::new(kind, message));
        }
    }

    /// Helper: Binance sends numeric values as JSON strings or numbers
    /// depending on endpoint.
    fn parse_num(val: &serde_json::Value) -> Result<f64, FleetError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| FleetError::new(ErrorKind::Network, format!("bad numeric field: {s}")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(FleetError::new(
                ErrorKind::Network,
                "expected string or number field".to_string(),
            ))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    #[instrument(skip(self), name = "binance::get_price")]
    async fn get_price(&self, symbol: &str) -> Result<f64, FleetError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let (_status, body) = self.get_with_retry(&url).await?;
        let price = body
            .get("price")
            .ok_or_else(|| FleetError::new(ErrorKind::SymbolUnsupported, "symbol not found"))?;
        Self::parse_num(price)
    }

    /// GET /api/v3/klines (public). Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
    ///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, FleetError> {
        if !self.rate_limit.can_send_request(KLINES_WEIGHT) {
            return Err(FleetError::new(
                ErrorKind::RateLimited,
                "klines request would exceed the adapter's rate budget",
            ));
        }

        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, timeframe, limit
        );

        let (_status, body) = self.get_with_retry(&url).await?;
        let raw = body
            .as_array()
            .ok_or_else(|| FleetError::new(ErrorKind::Network, "klines response is not an array"))?;

        let now_ms = Self::timestamp_ms() as i64;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 11 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            let open_time = arr[0].as_i64().unwrap_or(0);
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle {
                open_time,
                close_time,
                open: Self::parse_num(&arr[1])?,
                high: Self::parse_num(&arr[2])?,
                low: Self::parse_num(&arr[3])?,
                close: Self::parse_num(&arr[4])?,
                volume: Self::parse_num(&arr[5])?,
                quote_volume: Self::parse_num(&arr[7])?,
                trades_count: arr[8].as_u64().unwrap_or(0),
                taker_buy_volume: Self::parse_num(&arr[9])?,
                taker_buy_quote_volume: Self::parse_num(&arr[10])?,
                is_closed: close_time < now_ms,
            });
        }

        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "binance::get_balance")]
    async fn get_balance(&self, asset: &str, mode: TradingMode) -> Result<f64, FleetError> {
        if mode != TradingMode::Spot {
            // Margin/futures account endpoints are not wired in the
            // reference venue used here; surface as unsupported rather than
            // silently reading the spot balance.
            return Err(FleetError::new(
                ErrorKind::ModeUnsupported,
                format!("{mode} balance lookup is not available on this venue"),
            ));
        }

        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);
        let (_status, body) = self.get_with_retry(&url).await?;

        let balances = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| FleetError::new(ErrorKind::Network, "account response missing balances"))?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free = b["free"].as_str().unwrap_or("0").parse::<f64>().unwrap_or(0.0);
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    #[instrument(skip(self, quantity), name = "binance::place_market_order")]
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        mode: TradingMode,
    ) -> Result<OrderAck, FleetError> {
        if mode != TradingMode::Spot {
            return Err(FleetError::new(
                ErrorKind::ModeUnsupported,
                format!("{mode} order placement is not available on this venue"),
            ));
        }
        if !self.rate_limit.can_place_order() {
            return Err(FleetError::new(
                ErrorKind::RateLimited,
                "order rate limit reached",
            ));
        }

        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={quantity}",
            side.as_str()
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side = side.as_str(), quantity, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| FleetError::new(ErrorKind::Network, e.to_string()))?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FleetError::new(ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            let kind = classify_http_status(status, &body);
            let message = body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("order placement failed")
                .to_string();
            return Err(FleetError::new(kind, message));
        }

        self.rate_limit.record_order_sent();

        let order_id = body
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let ts = body.get("transactTime").and_then(|v| v.as_i64()).unwrap_or(0);

        let fills = body
            .get("fills")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|f| {
                        let qty = Self::parse_num(&f["qty"]).ok()?;
                        let price = Self::parse_num(&f["price"]).ok()?;
                        let quote_qty = qty * price;
                        let fee = f.get("commission").and_then(|c| Self::parse_num(c).ok());
                        Some(Fill {
                            qty,
                            quote_qty,
                            price,
                            fee,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        debug!(symbol, order_id = %order_id, "order placed successfully");
        Ok(OrderAck { order_id, fills, ts })
    }

    #[instrument(skip(self), name = "binance::get_24h_stats")]
    async fn get_24h_stats(&self, symbol: &str) -> Result<Stats24h, FleetError> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        let (_status, body) = self.get_with_retry(&url).await?;
        Ok(Stats24h {
            volume_quote: body
                .get("quoteVolume")
                .map(Self::parse_num)
                .transpose()?
                .unwrap_or(0.0),
            price_change_pct: body
                .get("priceChangePercent")
                .map(Self::parse_num)
                .transpose()?
                .unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "binance::list_tradable_symbols")]
    async fn list_tradable_symbols(&self, quote: &str) -> Result<Vec<String>, FleetError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let (_status, body) = self.get_with_retry(&url).await?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| FleetError::new(ErrorKind::Network, "exchangeInfo missing symbols"))?;

        let result = symbols
            .iter()
            .filter(|s| {
                s.get("quoteAsset").and_then(|v| v.as_str()) == Some(quote)
                    && s.get("status").and_then(|v| v.as_str()) == Some("TRADING")
            })
            .filter_map(|s| s.get("symbol").and_then(|v| v.as_str()).map(String::from))
            .collect();

        Ok(result)
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let _ = &self.api_key;
        let _ = &self.secret;
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vwap_of_single_fill() {
        let ack = OrderAck {
            order_id: "1".into(),
            fills: vec![Fill {
                qty: 2.0,
                quote_qty: 200.0,
                price: 100.0,
                fee: None,
            }],
            ts: 0,
        };
        assert!((ack.vwap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_of_multiple_fills_is_weighted() {
        let ack = OrderAck {
            order_id: "1".into(),
            fills: vec![
                Fill { qty: 1.0, quote_qty: 100.0, price: 100.0, fee: None },
                Fill { qty: 3.0, quote_qty: 330.0, price: 110.0, fee: None },
            ],
            ts: 0,
        };
        assert!((ack.vwap() - 107.5).abs() < 1e-9);
    }

    #[test]
    fn debug_redacts_secrets() {
        let adapter = BinanceAdapter::new("my-api-key", "my-secret", true);
        let debug_str = format!("{adapter:?}");
        assert!(!debug_str.contains("my-api-key"));
        assert!(!debug_str.contains("my-secret"));
    }

    #[test]
    fn can_short_by_mode() {
        assert!(!TradingMode::Spot.can_short());
        assert!(TradingMode::Margin.can_short());
        assert!(TradingMode::Futures.can_short());
    }
}
