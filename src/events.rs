// =============================================================================
// Event Bus (C9) — single-writer-per-topic broadcast
// =============================================================================
//
// Replaces the teacher's single full-snapshot-push WebSocket model
// (`api/ws.rs`'s `AtomicU64` version counter polled by the WS handler) with
// genuine per-topic pub/sub via `tokio::sync::broadcast::channel`. Delivery
// is best-effort, at-most-once per subscriber: a slow consumer is dropped
// messages (the channel's lagged-receiver behavior), never blocking a
// publisher — the teacher's own "never block the trading path" principle,
// applied here to events instead of persistence writes.

use serde::Serialize;
use tokio::sync::broadcast;

/// Bounded per-topic buffer. A subscriber more than this many messages behind
/// observes a gap (detected via `RecvError::Lagged`) rather than the
/// publisher blocking or growing memory unboundedly.
const TOPIC_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    BotState,
    BotAnalysis,
    TradeOpened,
    TradeClosed,
    ControllerCycle,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::BotState => "bot.state",
            Topic::BotAnalysis => "bot.analysis",
            Topic::TradeOpened => "trade.opened",
            Topic::TradeClosed => "trade.closed",
            Topic::ControllerCycle => "controller.cycle",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: &'static str,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

/// One broadcast channel per topic. Topics publish independently so a burst
/// on one (e.g. `bot.analysis`, emitted every tick) cannot starve another
/// (e.g. `trade.closed`, emitted rarely) — no guaranteed ordering across
/// topics, per-topic FIFO.
pub struct EventBus {
    bot_state: broadcast::Sender<Event>,
    bot_analysis: broadcast::Sender<Event>,
    trade_opened: broadcast::Sender<Event>,
    trade_closed: broadcast::Sender<Event>,
    controller_cycle: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            bot_state: broadcast::channel(TOPIC_BUFFER).0,
            bot_analysis: broadcast::channel(TOPIC_BUFFER).0,
            trade_opened: broadcast::channel(TOPIC_BUFFER).0,
            trade_closed: broadcast::channel(TOPIC_BUFFER).0,
            controller_cycle: broadcast::channel(TOPIC_BUFFER).0,
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::BotState => &self.bot_state,
            Topic::BotAnalysis => &self.bot_analysis,
            Topic::TradeOpened => &self.trade_opened,
            Topic::TradeClosed => &self.trade_closed,
            Topic::ControllerCycle => &self.controller_cycle,
        }
    }

    /// Publish on a topic. A `SendError` (no subscribers) is expected and
    /// silently dropped — the bus has no durability contract.
    pub fn publish(&self, topic: Topic, timestamp: i64, payload: serde_json::Value) {
        let event = Event {
            topic: topic.as_str(),
            timestamp,
            payload,
        };
        let _ = self.sender(topic).send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.sender(topic).subscribe()
    }

    /// Subscribe to every topic at once, for the `/ws` façade.
    pub fn subscribe_all(&self) -> Vec<(Topic, broadcast::Receiver<Event>)> {
        [
            Topic::BotState,
            Topic::BotAnalysis,
            Topic::TradeOpened,
            Topic::TradeClosed,
            Topic::ControllerCycle,
        ]
        .into_iter()
        .map(|t| (t, self.subscribe(t)))
        .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
