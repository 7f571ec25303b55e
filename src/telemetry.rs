use crate::event::{EventSink, MarketEvent, PerfSnapshot, StatusSnapshot};
use crate::now_unix_ms;
use crate::session::SharedFlags;

use exchange::{ConnectionState, MarketKind, Timeframe};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const PERF_WINDOW_CAPACITY: usize = 1_024;
pub const STATUS_HEARTBEAT_MS: u64 = 1_000;
pub const PERF_EMIT_EVERY_HEARTBEATS: u64 = 5;

/// Identical non-live (state, reason) pairs within this window collapse to a
/// single transition-driven emission. The heartbeat is exempt.
pub const STATUS_REPEAT_WINDOW: Duration = Duration::from_secs(2);

/// Gauges the Consumer and heartbeat read without touching the state mutex.
/// Monotonic counters and last-write-wins values; relaxed ordering is enough.
#[derive(Debug, Default)]
pub struct TelemetryAtomics {
    connection_state: AtomicU8,
    has_last_agg_id: AtomicBool,
    last_agg_id: AtomicU64,
    has_latency_ms: AtomicBool,
    latency_ms: AtomicI64,
    has_raw_exchange_latency_ms: AtomicBool,
    raw_exchange_latency_ms: AtomicI64,
    has_clock_offset_ms: AtomicBool,
    clock_offset_ms: AtomicI64,
    has_adjusted_network_latency_ms: AtomicBool,
    adjusted_network_latency_ms: AtomicI64,
    has_local_pipeline_latency_ms: AtomicBool,
    local_pipeline_latency_ms: AtomicI64,
}

impl TelemetryAtomics {
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.connection_state.load(Ordering::Relaxed))
    }

    pub fn set_last_agg_id(&self, agg_id: u64) {
        self.last_agg_id.store(agg_id, Ordering::Relaxed);
        self.has_last_agg_id.store(true, Ordering::Relaxed);
    }

    pub fn last_agg_id(&self) -> Option<u64> {
        if self.has_last_agg_id.load(Ordering::Relaxed) {
            Some(self.last_agg_id.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn set_network_latencies(&self, raw_ms: i64, adjusted_ms: i64) {
        self.raw_exchange_latency_ms.store(raw_ms, Ordering::Relaxed);
        self.has_raw_exchange_latency_ms
            .store(true, Ordering::Relaxed);

        self.adjusted_network_latency_ms
            .store(adjusted_ms, Ordering::Relaxed);
        self.has_adjusted_network_latency_ms
            .store(true, Ordering::Relaxed);

        // Legacy field older shells read as "latencyMs".
        self.latency_ms.store(adjusted_ms, Ordering::Relaxed);
        self.has_latency_ms.store(true, Ordering::Relaxed);
    }

    pub fn set_clock_offset_ms(&self, offset_ms: i64) {
        self.clock_offset_ms.store(offset_ms, Ordering::Relaxed);
        self.has_clock_offset_ms.store(true, Ordering::Relaxed);
    }

    pub fn clock_offset_ms(&self) -> Option<i64> {
        if self.has_clock_offset_ms.load(Ordering::Relaxed) {
            Some(self.clock_offset_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    pub fn set_local_pipeline_latency_ms(&self, latency_ms: i64) {
        self.local_pipeline_latency_ms
            .store(latency_ms, Ordering::Relaxed);
        self.has_local_pipeline_latency_ms
            .store(true, Ordering::Relaxed);
    }

    pub fn local_pipeline_latency_ms(&self) -> Option<i64> {
        if self.has_local_pipeline_latency_ms.load(Ordering::Relaxed) {
            Some(self.local_pipeline_latency_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn latency_ms(&self) -> Option<i64> {
        if self.has_latency_ms.load(Ordering::Relaxed) {
            Some(self.latency_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn raw_exchange_latency_ms(&self) -> Option<i64> {
        if self.has_raw_exchange_latency_ms.load(Ordering::Relaxed) {
            Some(self.raw_exchange_latency_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn adjusted_network_latency_ms(&self) -> Option<i64> {
        if self
            .has_adjusted_network_latency_ms
            .load(Ordering::Relaxed)
        {
            Some(self.adjusted_network_latency_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

/// Fixed-capacity latency window. Single producer stores into atomic cells,
/// the snapshotting side copies and sorts locally; no lock on the hot path.
#[derive(Debug)]
pub struct LatencyRing {
    values: Box<[AtomicU32]>,
    pushed: AtomicUsize,
}

impl Default for LatencyRing {
    fn default() -> Self {
        let values = (0..PERF_WINDOW_CAPACITY)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            values,
            pushed: AtomicUsize::new(0),
        }
    }
}

impl LatencyRing {
    pub fn record(&self, value: u32) {
        let at = self.pushed.fetch_add(1, Ordering::Relaxed);
        self.values[at % PERF_WINDOW_CAPACITY].store(value, Ordering::Relaxed);
    }

    /// Copies the window, resets it, and returns (p50, p95, p99).
    pub fn take_percentiles(&self) -> (Option<u32>, Option<u32>, Option<u32>) {
        let pushed = self.pushed.swap(0, Ordering::Relaxed);
        let len = pushed.min(PERF_WINDOW_CAPACITY);
        if len == 0 {
            return (None, None, None);
        }

        let mut local: Vec<u32> = self.values[..len]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        local.sort_unstable();

        (
            percentile_from_sorted(&local, 50),
            percentile_from_sorted(&local, 95),
            percentile_from_sorted(&local, 99),
        )
    }
}

fn percentile_from_sorted(sorted_values: &[u32], percentile: usize) -> Option<u32> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len().saturating_sub(1);
    let index = max_index.saturating_mul(percentile).saturating_div(100);
    sorted_values.get(index).copied()
}

/// Hot-path performance counters: parse/apply/local-pipeline windows plus
/// cumulative ingest and emit counts (`ingest_count >= emit_count` always).
#[derive(Debug, Default)]
pub struct PerfStats {
    parse_us: LatencyRing,
    apply_us: LatencyRing,
    local_pipeline_ms: LatencyRing,
    ingest_count: AtomicU64,
    emit_count: AtomicU64,
}

impl PerfStats {
    pub fn record_ingest(&self, parse_us: u32, apply_us: u32, local_pipeline_ms: u32) {
        self.parse_us.record(parse_us);
        self.apply_us.record(apply_us);
        self.local_pipeline_ms.record(local_pipeline_ms);
        self.ingest_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emit(&self) {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ingest_count(&self) -> u64 {
        self.ingest_count.load(Ordering::Relaxed)
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }

    /// Percentiles of the windows since the previous snapshot; counters stay
    /// cumulative.
    pub fn snapshot(&self, now_ms: i64) -> PerfSnapshot {
        let (parse_p50_us, parse_p95_us, parse_p99_us) = self.parse_us.take_percentiles();
        let (apply_p50_us, apply_p95_us, apply_p99_us) = self.apply_us.take_percentiles();
        let (local_pipeline_p50_ms, local_pipeline_p95_ms, local_pipeline_p99_ms) =
            self.local_pipeline_ms.take_percentiles();

        PerfSnapshot {
            t: now_ms,
            parse_p50_us,
            parse_p95_us,
            parse_p99_us,
            apply_p50_us,
            apply_p95_us,
            apply_p99_us,
            local_pipeline_p50_ms,
            local_pipeline_p95_ms,
            local_pipeline_p99_ms,
            ingest_count: self.ingest_count(),
            emit_count: self.emit_count(),
        }
    }
}

#[derive(Debug, Default)]
struct StatusThrottle {
    last_state: Option<ConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

/// Builds and publishes `market_status` snapshots for one session identity.
#[derive(Debug)]
pub struct StatusChannel {
    telemetry: Arc<TelemetryAtomics>,
    sink: EventSink,
    market_kind: MarketKind,
    symbol: String,
    timeframe: Timeframe,
    throttle: Mutex<StatusThrottle>,
}

impl StatusChannel {
    pub fn new(
        telemetry: Arc<TelemetryAtomics>,
        sink: EventSink,
        market_kind: MarketKind,
        symbol: String,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            telemetry,
            sink,
            market_kind,
            symbol,
            timeframe,
            throttle: Mutex::new(StatusThrottle::default()),
        }
    }

    /// State transition: always published.
    pub fn publish(&self, state: ConnectionState, reason: Option<String>) {
        self.record(state, &reason);
        self.emit(state, reason);
    }

    /// Repeatable failure path: identical non-live (state, reason) within the
    /// repeat window collapse to one emission.
    pub fn publish_throttled(&self, state: ConnectionState, reason: Option<String>) {
        if self.record_if_allowed(state, &reason) {
            self.emit(state, reason);
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let reason = self.throttle.lock().last_reason.clone();
        self.snapshot_with(self.telemetry.connection_state(), reason)
    }

    pub fn state(&self) -> ConnectionState {
        self.telemetry.connection_state()
    }

    fn record(&self, state: ConnectionState, reason: &Option<String>) {
        let mut throttle = self.throttle.lock();
        throttle.last_state = Some(state);
        throttle.last_reason = reason.clone();
        throttle.last_emit = Some(Instant::now());
    }

    fn record_if_allowed(&self, state: ConnectionState, reason: &Option<String>) -> bool {
        let mut throttle = self.throttle.lock();
        let now = Instant::now();

        let repeated = state != ConnectionState::Live
            && throttle.last_state == Some(state)
            && throttle.last_reason == *reason
            && throttle
                .last_emit
                .is_some_and(|at| now.duration_since(at) < STATUS_REPEAT_WINDOW);

        if repeated {
            return false;
        }

        throttle.last_state = Some(state);
        throttle.last_reason = reason.clone();
        throttle.last_emit = Some(now);
        true
    }

    fn emit(&self, state: ConnectionState, reason: Option<String>) {
        self.telemetry.set_connection_state(state);
        let snapshot = self.snapshot_with(state, reason);
        self.sink.publish(MarketEvent::Status(snapshot));
    }

    fn snapshot_with(&self, state: ConnectionState, reason: Option<String>) -> StatusSnapshot {
        StatusSnapshot {
            state,
            market_kind: self.market_kind,
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            last_agg_id: self.telemetry.last_agg_id(),
            latency_ms: self.telemetry.latency_ms(),
            raw_exchange_latency_ms: self.telemetry.raw_exchange_latency_ms(),
            clock_offset_ms: self.telemetry.clock_offset_ms(),
            adjusted_network_latency_ms: self.telemetry.adjusted_network_latency_ms(),
            local_pipeline_latency_ms: self.telemetry.local_pipeline_latency_ms(),
            reason,
        }
    }
}

/// Heartbeat task: one `market_status` per second regardless of throttling,
/// plus a `market_perf` snapshot every fifth beat while enabled.
pub(crate) async fn run_heartbeat(
    status: Arc<StatusChannel>,
    perf: Arc<PerfStats>,
    flags: Arc<SharedFlags>,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut beats: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sink.publish(MarketEvent::Status(status.snapshot()));

                beats = beats.wrapping_add(1);
                if flags.perf_telemetry() && beats % PERF_EMIT_EVERY_HEARTBEATS == 0 {
                    sink.publish(MarketEvent::Perf(perf.snapshot(now_unix_ms())));
                }
            }
        }
    }
}
