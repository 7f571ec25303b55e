use crate::conflation::ConflatedState;
use crate::consumer;
use crate::clock;
use crate::event::{EventSink, StatusSnapshot};
use crate::history;
use crate::producer::{self, ProducerExit};
use crate::session::{Session, SharedFlags, StartStreamArgs, StartupMode, StreamConfig};
use crate::telemetry::{PerfStats, StatusChannel, TelemetryAtomics};
use crate::EngineError;

use exchange::{ConnectionState, MarketKind, adapter};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Bound on joining a cancelled session before it is abandoned.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const REST_TIMEOUT: Duration = Duration::from_secs(10);

static GLOBAL_CONTROLLER: OnceLock<Arc<MarketController>> = OnceLock::new();

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResult {
    pub stopped: bool,
}

struct ActiveSession {
    session: Session,
    config: StreamConfig,
    flags: Arc<SharedFlags>,
    status: Arc<StatusChannel>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Owns the pipeline lifecycle: at most one live session per controller,
/// replaced on identity change, refreshed in place otherwise.
pub struct MarketController {
    sink: EventSink,
    http: reqwest::Client,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    starting: AtomicBool,
}

struct StartGuard<'a>(&'a AtomicBool);

impl<'a> StartGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
            .then(|| Self(flag))
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MarketController {
    pub fn new(sink: EventSink) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            sink,
            http,
            active: tokio::sync::Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    /// Registers this controller as the process-wide instance. Returns false
    /// when one is already installed.
    pub fn install_global(controller: Arc<MarketController>) -> bool {
        GLOBAL_CONTROLLER.set(controller).is_ok()
    }

    pub fn global() -> Option<Arc<MarketController>> {
        GLOBAL_CONTROLLER.get().cloned()
    }

    /// `start_market_stream`: validates args, then either refreshes the flag
    /// set of a same-identity running session or replaces the pipeline.
    pub async fn start(&self, args: StartStreamArgs) -> Result<Session, EngineError> {
        let config = args.normalize()?;
        let _guard =
            StartGuard::acquire(&self.starting).ok_or(EngineError::AlreadyStarting)?;

        let mut active = self.active.lock().await;

        if let Some(existing) = active.as_mut()
            && existing.config.same_stream(&config)
        {
            existing.flags.apply(&config);
            existing.config.min_notional_usdt = config.min_notional_usdt;
            existing.config.emit_legacy_price_event = config.emit_legacy_price_event;
            existing.config.emit_legacy_frame_events = config.emit_legacy_frame_events;
            existing.config.perf_telemetry = config.perf_telemetry;
            existing.session.refresh_flags(&config);
            return Ok(existing.session.clone());
        }

        if let Some(previous) = active.take() {
            shutdown(previous).await;
        }

        let next = self.spawn_session(config);
        let session = next.session.clone();
        *active = Some(next);
        Ok(session)
    }

    /// `stop_market_stream`: idempotent; `stopped: true` whether or not a
    /// pipeline was running.
    pub async fn stop(&self) -> StopResult {
        let existing = self.active.lock().await.take();
        if let Some(existing) = existing {
            shutdown(existing).await;
        }
        StopResult { stopped: true }
    }

    /// `market_stream_status`: the current snapshot from atomics, or the
    /// stopped default when nothing runs.
    pub async fn status(&self) -> StatusSnapshot {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(active) => active.status.snapshot(),
            None => StatusSnapshot::stopped(Some("stream idle".to_string())),
        }
    }

    /// `market_symbols`: tradable symbols for the endpoint family, sorted.
    pub async fn symbols(&self, market: MarketKind) -> Result<Vec<String>, EngineError> {
        Ok(adapter::fetch_symbols(&self.http, market).await?)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.sink.frames_dropped()
    }

    fn spawn_session(&self, config: StreamConfig) -> ActiveSession {
        let session = Session::from_config(&config);
        let config = Arc::new(config);
        let flags = Arc::new(SharedFlags::from_config(&config));
        let state = Arc::new(Mutex::new(ConflatedState::default()));
        let telemetry = Arc::new(TelemetryAtomics::default());
        let perf = Arc::new(PerfStats::default());
        let status = Arc::new(StatusChannel::new(
            Arc::clone(&telemetry),
            self.sink.clone(),
            config.market_kind,
            config.symbol.clone(),
            config.timeframe,
        ));
        let cancel = CancellationToken::new();

        let join = tokio::spawn(run_session(
            Arc::clone(&config),
            Arc::clone(&flags),
            state,
            telemetry,
            perf,
            Arc::clone(&status),
            self.sink.clone(),
            self.http.clone(),
            cancel.clone(),
        ));

        ActiveSession {
            session,
            config: (*config).clone(),
            flags,
            status,
            cancel,
            join,
        }
    }
}

/// Cancels the session and joins it within the shutdown bound; a task that
/// does not yield in time is abandoned.
async fn shutdown(active: ActiveSession) {
    active.cancel.cancel();

    let mut join = active.join;
    tokio::select! {
        _ = &mut join => {}
        _ = tokio::time::sleep(SHUTDOWN_JOIN_TIMEOUT) => {
            log::warn!(
                "session for {} did not stop within {:?}; abandoning task",
                active.config.symbol,
                SHUTDOWN_JOIN_TIMEOUT
            );
            join.abort();
        }
    }
}

/// One session: Consumer, Heartbeat and ClockSync tasks around the Producer,
/// with the HistoryLoader either racing the live stream (LiveFirst) or
/// completing before it (HistoryFirst).
#[allow(clippy::too_many_arguments)]
async fn run_session(
    config: Arc<StreamConfig>,
    flags: Arc<SharedFlags>,
    state: Arc<Mutex<ConflatedState>>,
    telemetry: Arc<TelemetryAtomics>,
    perf: Arc<PerfStats>,
    status: Arc<StatusChannel>,
    sink: EventSink,
    http: reqwest::Client,
    cancel: CancellationToken,
) {
    let consumer_handle = tokio::spawn(consumer::run(
        Arc::clone(&state),
        Arc::clone(&flags),
        Arc::clone(&telemetry),
        Arc::clone(&perf),
        sink.clone(),
        config.emit_interval_ms,
        cancel.clone(),
    ));

    let heartbeat_handle = tokio::spawn(crate::telemetry::run_heartbeat(
        Arc::clone(&status),
        Arc::clone(&perf),
        Arc::clone(&flags),
        sink.clone(),
        cancel.clone(),
    ));

    // The mock pipeline is fully local; probing server time would only
    // inject network noise into deterministic runs.
    let clock_handle = (!config.mock_mode).then(|| {
        tokio::spawn(clock::run(
            http.clone(),
            config.market_kind,
            config.clock_sync_interval_ms,
            Arc::clone(&telemetry),
            cancel.clone(),
        ))
    });

    let history_ctx = history::HistoryContext {
        config: Arc::clone(&config),
        http: http.clone(),
        state: Arc::clone(&state),
        status: Arc::clone(&status),
        sink: sink.clone(),
        cancel: cancel.clone(),
    };

    let history_handle = match config.startup_mode {
        StartupMode::HistoryFirst => {
            status.publish(
                ConnectionState::Connecting,
                Some("loading historical candles".to_string()),
            );
            history::run(history_ctx).await;
            None
        }
        StartupMode::LiveFirst => Some(tokio::spawn(history::run(history_ctx))),
    };

    let producer_ctx = producer::ProducerContext {
        config: Arc::clone(&config),
        flags,
        state,
        telemetry,
        perf,
        status: Arc::clone(&status),
        http,
        cancel: cancel.clone(),
    };

    let exit = if config.mock_mode {
        producer::run_mock(producer_ctx).await
    } else {
        producer::run(producer_ctx).await
    };

    cancel.cancel();
    let _ = consumer_handle.await;
    let _ = heartbeat_handle.await;
    if let Some(handle) = clock_handle {
        let _ = handle.await;
    }
    if let Some(handle) = history_handle {
        let _ = handle.await;
    }

    match exit {
        ProducerExit::Cancelled => {
            status.publish(
                ConnectionState::Stopped,
                Some("stream stopped".to_string()),
            );
        }
        // Terminal error status was already published with its reason.
        ProducerExit::Fatal(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MarketEvent;

    use tokio::time::{Instant, timeout_at};

    fn mock_args() -> StartStreamArgs {
        StartStreamArgs {
            mock_mode: Some(true),
            history_limit: Some(25),
            emit_interval_ms: Some(8),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_is_idempotent_without_a_session() {
        let (sink, _rx) = EventSink::channel(64);
        let controller = MarketController::new(sink);

        assert!(controller.stop().await.stopped);
        assert!(controller.stop().await.stopped);

        let status = controller.status().await;
        assert_eq!(status.state, ConnectionState::Stopped);
        assert_eq!(status.symbol, "BTCUSDT");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_rejects_invalid_args() {
        let (sink, _rx) = EventSink::channel(64);
        let controller = MarketController::new(sink);

        let result = controller
            .start(StartStreamArgs {
                symbol: Some("BTC/USDT".to_string()),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(EngineError::InvalidArgs(_))));

        // nothing was started
        assert_eq!(controller.status().await.state, ConnectionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mock_session_streams_bootstrap_status_and_frames() {
        let (sink, mut rx) = EventSink::channel(2_048);
        let controller = MarketController::new(sink);

        let session = controller
            .start(mock_args())
            .await
            .expect("mock session starts");
        assert!(session.running);
        assert!(session.mock_mode);
        assert_eq!(session.emit_interval_ms, 8);

        let mut saw_bootstrap = false;
        let mut saw_delta_bootstrap = false;
        let mut saw_live = false;
        let mut frames_seen = 0_u32;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !(saw_bootstrap && saw_delta_bootstrap && saw_live && frames_seen >= 2) {
            let event = timeout_at(deadline, rx.recv())
                .await
                .expect("pipeline produced events before the deadline")
                .expect("event channel open");

            match event {
                MarketEvent::CandlesBootstrap(bootstrap) => {
                    assert_eq!(bootstrap.candles.len(), 25);
                    assert_eq!(bootstrap.symbol, "BTCUSDT");
                    saw_bootstrap = true;
                }
                MarketEvent::DeltaCandlesBootstrap(bootstrap) => {
                    assert_eq!(bootstrap.candles.len(), 25);
                    saw_delta_bootstrap = true;
                }
                MarketEvent::Status(status) => {
                    if status.state == ConnectionState::Live {
                        saw_live = true;
                    }
                }
                MarketEvent::Frame(frame) => {
                    // live status always precedes the first frame
                    assert!(saw_live, "frame emitted before live status");
                    if let Some(candle) = &frame.candle {
                        assert!(candle.low <= candle.open.min(candle.close));
                        assert!(candle.high >= candle.open.max(candle.close));
                        assert!(candle.volume >= 0.0);
                    }
                    if let Some(delta) = &frame.delta_candle {
                        assert!(delta.low <= delta.close && delta.close <= delta.high);
                    }
                    frames_seen += 1;
                }
                _ => {}
            }
        }

        let status = controller.status().await;
        assert_eq!(status.state, ConnectionState::Live);
        assert!(status.last_agg_id.is_some());

        assert!(controller.stop().await.stopped);
        assert_eq!(controller.status().await.state, ConnectionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_identity_start_refreshes_flags_in_place() {
        let (sink, _rx) = EventSink::channel(2_048);
        let controller = MarketController::new(sink);

        let first = controller
            .start(mock_args())
            .await
            .expect("mock session starts");
        assert_eq!(first.min_notional_usdt, 100.0);
        assert!(!first.perf_telemetry);

        let refreshed = controller
            .start(StartStreamArgs {
                min_notional_usdt: Some(555.0),
                perf_telemetry: Some(true),
                ..mock_args()
            })
            .await
            .expect("refresh succeeds");

        assert_eq!(refreshed.min_notional_usdt, 555.0);
        assert!(refreshed.perf_telemetry);
        assert_eq!(refreshed.symbol, first.symbol);
        assert_eq!(refreshed.timeframe, first.timeframe);

        assert!(controller.stop().await.stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn global_slot_installs_once() {
        let (sink, _rx) = EventSink::channel(16);
        let controller = Arc::new(MarketController::new(sink));

        if MarketController::install_global(Arc::clone(&controller)) {
            // second install is refused once a controller is registered
            assert!(!MarketController::install_global(controller));
        }
        assert!(MarketController::global().is_some());
    }
}
