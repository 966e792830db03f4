// =============================================================================
// Bot Engine (C5) — data model
// =============================================================================
//
// `Bot`, `Position`, and `Trade` follow spec §3 verbatim. Serialization
// derives and `#[serde(skip_serializing_if = "Option::is_none")]` usage
// mirror the teacher's practice in `position_engine.rs` and
// `decision_envelope.rs` of deriving `Serialize` on every struct that
// crosses a process boundary and hiding absent optional fields.

use serde::{Deserialize, Serialize};

use crate::exchange::TradingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotState::Idle => "Idle",
            BotState::Running => "Running",
            BotState::Stopping => "Stopping",
            BotState::Stopped => "Stopped",
            BotState::Errored => "Errored",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Why a position was closed. Kept as a string-backed enum (spec's
/// `exit_reason ∈ {SIGNAL, STOP_LOSS, TAKE_PROFIT, MANUAL} ∪ null`) so it
/// round-trips cleanly through SQLite's TEXT columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "SIGNAL",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Manual => "MANUAL",
        }
    }
}

/// A bot's single open position. Trailing-stop accumulators
/// (`highest_price`/`lowest_price`) and `tp_armed` are updated every tick by
/// the risk gate (spec §4.5 step 2) before strategy evaluation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_timestamp: i64,
    pub decision_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub buy_trade_id: String,
    /// Take-profit becomes eligible to fire only once unrealized P&L has
    /// reached `TP_MIN_PCT` at least once (spec GLOSSARY: "Arming").
    pub tp_armed: bool,
}

impl Position {
    pub fn new(
        direction: Direction,
        entry_price: f64,
        quantity: f64,
        entry_timestamp: i64,
        decision_price: f64,
        buy_trade_id: String,
    ) -> Self {
        Self {
            direction,
            entry_price,
            quantity,
            entry_timestamp,
            decision_price,
            highest_price: entry_price,
            lowest_price: entry_price,
            buy_trade_id,
            tp_armed: false,
        }
    }

    /// Unrealized P&L as a fraction (e.g. 0.02 == +2%), net of a symmetric
    /// fee estimate applied to both legs.
    pub fn unrealized_pnl_pct(&self, mark: f64, fee_rate: f64) -> f64 {
        let raw = match self.direction {
            Direction::Long => (mark - self.entry_price) / self.entry_price,
            Direction::Short => (self.entry_price - mark) / self.entry_price,
        };
        raw - 2.0 * fee_rate
    }

    /// Update the trailing accumulators for a new mark price.
    pub fn update_trail(&mut self, mark: f64) {
        if mark > self.highest_price {
            self.highest_price = mark;
        }
        if mark < self.lowest_price {
            self.lowest_price = mark;
        }
    }

    /// The favorable-excursion reference price used for the trailing
    /// take-profit: the best price seen since entry.
    pub fn best_excursion(&self) -> f64 {
        match self.direction {
            Direction::Long => self.highest_price,
            Direction::Short => self.lowest_price,
        }
    }
}

/// Append-only record of a single fill group (spec §3). Immutable once
/// written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub bot_id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub decision_price: f64,
    pub execution_price: f64,
    pub decision_timestamp: i64,
    pub execution_timestamp: i64,
    pub execution_delay_seconds: f64,
    pub price_slippage_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    pub strategy: String,
    pub confidence: f64,
    pub indicators: serde_json::Value,
}

/// A single independent trading bot (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub bot_id: String,
    pub symbol: String,
    pub strategy_name: String,
    pub timeframe: String,
    pub trading_mode: TradingMode,
    pub allocated_amount: f64,
    pub autonomous: bool,
    pub created_by: String,
    pub created_at: i64,
    pub state: BotState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl Bot {
    pub fn new(
        bot_id: String,
        symbol: String,
        strategy_name: String,
        timeframe: String,
        trading_mode: TradingMode,
        allocated_amount: f64,
        autonomous: bool,
        created_by: String,
        created_at: i64,
    ) -> Self {
        Self {
            bot_id,
            symbol,
            strategy_name,
            timeframe,
            trading_mode,
            allocated_amount,
            autonomous,
            created_by,
            created_at,
            state: BotState::Idle,
            position: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.position.is_none()
    }
}
