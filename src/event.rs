use crate::session::DEFAULT_SYMBOL;

use exchange::{Candle, ConnectionState, DeltaCandle, MarketKind, Timeframe};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bound of the shell-facing event channel. A slow shell loses frames rather
/// than backpressuring the pipeline.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Latest trade visible to the shell: time, price, quantity, direction.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Tick {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "p")]
    pub price: f64,
    #[serde(rename = "v")]
    pub qty: f64,
    #[serde(rename = "d")]
    pub direction: i8,
}

/// One conflated frame: at most one per emit interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameUpdate {
    pub tick: Option<Tick>,
    pub candle: Option<Candle>,
    pub delta_candle: Option<DeltaCandle>,
    pub local_pipeline_latency_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub last_agg_id: Option<u64>,
    pub latency_ms: Option<i64>,
    pub raw_exchange_latency_ms: Option<i64>,
    pub clock_offset_ms: Option<i64>,
    pub adjusted_network_latency_ms: Option<i64>,
    pub local_pipeline_latency_ms: Option<i64>,
    pub reason: Option<String>,
}

impl StatusSnapshot {
    pub fn stopped(reason: Option<String>) -> Self {
        Self {
            state: ConnectionState::Stopped,
            market_kind: MarketKind::default(),
            symbol: DEFAULT_SYMBOL.to_string(),
            timeframe: Timeframe::M1,
            last_agg_id: None,
            latency_ms: None,
            raw_exchange_latency_ms: None,
            clock_offset_ms: None,
            adjusted_network_latency_ms: None,
            local_pipeline_latency_ms: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlesBootstrap {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaCandlesBootstrap {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candles: Vec<DeltaCandle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLoadProgress {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub pages_fetched: u32,
    pub candles_fetched: u64,
    pub estimated_total_candles: Option<u64>,
    pub progress_pct: Option<f64>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfSnapshot {
    pub t: i64,
    pub parse_p50_us: Option<u32>,
    pub parse_p95_us: Option<u32>,
    pub parse_p99_us: Option<u32>,
    pub apply_p50_us: Option<u32>,
    pub apply_p95_us: Option<u32>,
    pub apply_p99_us: Option<u32>,
    pub local_pipeline_p50_ms: Option<u32>,
    pub local_pipeline_p95_ms: Option<u32>,
    pub local_pipeline_p99_ms: Option<u32>,
    pub ingest_count: u64,
    pub emit_count: u64,
}

/// Everything the pipeline publishes to the shell, in emission order.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Status(StatusSnapshot),
    Frame(FrameUpdate),
    CandlesBootstrap(CandlesBootstrap),
    DeltaCandlesBootstrap(DeltaCandlesBootstrap),
    CandleUpdate(Candle),
    DeltaCandleUpdate(DeltaCandle),
    PriceUpdate(Tick),
    Perf(PerfSnapshot),
    HistoryProgress(HistoryLoadProgress),
}

impl MarketEvent {
    /// Wire name of the event as consumed by the shell.
    pub fn name(&self) -> &'static str {
        match self {
            MarketEvent::Status(_) => "market_status",
            MarketEvent::Frame(_) => "market_frame_update",
            MarketEvent::CandlesBootstrap(_) => "candles_bootstrap",
            MarketEvent::DeltaCandlesBootstrap(_) => "delta_candles_bootstrap",
            MarketEvent::CandleUpdate(_) => "candle_update",
            MarketEvent::DeltaCandleUpdate(_) => "delta_candle_update",
            MarketEvent::PriceUpdate(_) => "price_update",
            MarketEvent::Perf(_) => "market_perf",
            MarketEvent::HistoryProgress(_) => "history_load_progress",
        }
    }
}

/// Non-blocking publisher side of the shell channel. When the shell falls
/// behind, events are dropped and counted instead of stalling the pipeline.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<MarketEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<MarketEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EventSink {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn publish(&self, event: MarketEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("event channel full, dropping {}", event.name());
            }
            // Shell side is gone; the pipeline keeps running until stopped.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_and_counts() {
        let (sink, mut rx) = EventSink::channel(1);

        sink.publish(MarketEvent::PriceUpdate(Tick {
            time: 1,
            price: 10.0,
            qty: 1.0,
            direction: 1,
        }));
        sink.publish(MarketEvent::Status(StatusSnapshot::stopped(None)));
        sink.publish(MarketEvent::Status(StatusSnapshot::stopped(None)));

        assert_eq!(sink.frames_dropped(), 2);
        assert!(matches!(rx.try_recv(), Ok(MarketEvent::PriceUpdate(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn event_names_match_wire_contract() {
        let tick = Tick {
            time: 0,
            price: 0.0,
            qty: 0.0,
            direction: 0,
        };
        assert_eq!(MarketEvent::PriceUpdate(tick).name(), "price_update");
        assert_eq!(
            MarketEvent::Status(StatusSnapshot::stopped(None)).name(),
            "market_status"
        );
        assert_eq!(
            MarketEvent::Frame(FrameUpdate {
                tick: None,
                candle: None,
                delta_candle: None,
                local_pipeline_latency_ms: None,
            })
            .name(),
            "market_frame_update"
        );
    }

    #[test]
    fn status_snapshot_serializes_camel_case() {
        let json =
            serde_json::to_value(StatusSnapshot::stopped(Some("stream idle".to_string())))
                .expect("serializes");
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["marketKind"], "spot");
        assert_eq!(json["symbol"], "BTCUSDT");
        assert!(json["lastAggId"].is_null());
        assert_eq!(json["reason"], "stream idle");
    }

    #[test]
    fn tick_serializes_short_keys() {
        let json = serde_json::to_value(Tick {
            time: 5,
            price: 1.5,
            qty: 0.2,
            direction: -1,
        })
        .expect("serializes");
        assert_eq!(json["t"], 5);
        assert_eq!(json["p"], 1.5);
        assert_eq!(json["v"], 0.2);
        assert_eq!(json["d"], -1);
    }
}
