use crate::conflation::ConflatedState;
use crate::event::{EventSink, FrameUpdate, MarketEvent};
use crate::session::SharedFlags;
use crate::telemetry::{PerfStats, TelemetryAtomics};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

/// Fixed-cadence emitter: at most one combined frame per tick, skipped
/// entirely when no trade arrived since the previous one. Missed ticks are
/// dropped, never coalesced.
pub(crate) async fn run(
    state: Arc<Mutex<ConflatedState>>,
    flags: Arc<SharedFlags>,
    telemetry: Arc<TelemetryAtomics>,
    perf: Arc<PerfStats>,
    sink: EventSink,
    emit_interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(emit_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = {
                    let mut writable = state.lock();
                    writable.snapshot_for_emit()
                };

                if !snapshot.was_dirty {
                    continue;
                }

                perf.record_emit();

                let frame = FrameUpdate {
                    tick: snapshot.tick.clone(),
                    candle: snapshot.candle.clone(),
                    delta_candle: snapshot.delta_candle.clone(),
                    local_pipeline_latency_ms: telemetry.local_pipeline_latency_ms(),
                };
                sink.publish(MarketEvent::Frame(frame));

                if flags.emit_legacy_price_event()
                    && let Some(tick) = snapshot.tick
                {
                    sink.publish(MarketEvent::PriceUpdate(tick));
                }

                if flags.emit_legacy_frame_events() {
                    if let Some(candle) = snapshot.candle {
                        sink.publish(MarketEvent::CandleUpdate(candle));
                    }
                    if let Some(delta_candle) = snapshot.delta_candle {
                        sink.publish(MarketEvent::DeltaCandleUpdate(delta_candle));
                    }
                }
            }
        }
    }
}
