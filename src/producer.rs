use crate::clock;
use crate::conflation::ConflatedState;
use crate::now_unix_ms;
use crate::session::{SharedFlags, StreamConfig};
use crate::telemetry::{PerfStats, StatusChannel, TelemetryAtomics};

use exchange::{
    AggTrade, ConnectionState, Timeframe, adapter, connect, parse_agg_trade, resilience,
};

use fastwebsockets::{Frame, OpCode};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sustained malformed-frame rate that escalates to a terminal error.
const PROTOCOL_ERROR_LIMIT: u32 = 10;
const PROTOCOL_ERROR_WINDOW: Duration = Duration::from_secs(1);

const MOCK_TICK_INTERVAL: Duration = Duration::from_millis(4);

pub(crate) struct ProducerContext {
    pub config: Arc<StreamConfig>,
    pub flags: Arc<SharedFlags>,
    pub state: Arc<Mutex<ConflatedState>>,
    pub telemetry: Arc<TelemetryAtomics>,
    pub perf: Arc<PerfStats>,
    pub status: Arc<StatusChannel>,
    pub http: reqwest::Client,
    pub cancel: CancellationToken,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ProducerExit {
    Cancelled,
    Fatal(String),
}

/// Aggregate-id continuity tracker. Owned by the Producer; the shared
/// `last_agg_id` atomic only mirrors it for status reads.
#[derive(Debug, Default)]
pub(crate) struct SequenceGuard {
    last: Option<u64>,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SeqCheck {
    Seeded,
    InOrder,
    Gap { expected: u64, missed: u64 },
    Stale,
}

impl SequenceGuard {
    pub fn check(&mut self, agg_id: u64) -> SeqCheck {
        match self.last {
            None => {
                self.last = Some(agg_id);
                SeqCheck::Seeded
            }
            Some(last) if agg_id <= last => SeqCheck::Stale,
            Some(last) if agg_id == last + 1 => {
                self.last = Some(agg_id);
                SeqCheck::InOrder
            }
            Some(last) => SeqCheck::Gap {
                expected: last + 1,
                missed: agg_id - last - 1,
            },
        }
    }

    pub fn reset_to(&mut self, agg_id: u64) {
        self.last = Some(agg_id);
    }
}

#[derive(Debug)]
struct ParseErrorWindow {
    window_started: Instant,
    count: u32,
}

impl ParseErrorWindow {
    fn new() -> Self {
        Self {
            window_started: Instant::now(),
            count: 0,
        }
    }

    /// Returns true once the per-second budget is exhausted.
    fn record(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_started) > PROTOCOL_ERROR_WINDOW {
            self.window_started = now;
            self.count = 0;
        }
        self.count += 1;
        self.count > PROTOCOL_ERROR_LIMIT
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum IngestOutcome {
    Applied,
    Stale,
    Gap {
        expected: u64,
        found: u64,
        missed: u64,
    },
}

/// The per-trade hot path after parsing: sequence continuity, notional gate,
/// state merge under the mutex, then the telemetry writes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn ingest_trade(
    state: &Mutex<ConflatedState>,
    telemetry: &TelemetryAtomics,
    perf: &PerfStats,
    guard: &mut SequenceGuard,
    timeframe: Timeframe,
    min_notional_usdt: f64,
    trade: &AggTrade,
    received_at: Instant,
    parse_us: u32,
) -> IngestOutcome {
    match guard.check(trade.agg_id) {
        SeqCheck::Stale => return IngestOutcome::Stale,
        SeqCheck::Gap { expected, missed } => {
            return IngestOutcome::Gap {
                expected,
                found: trade.agg_id,
                missed,
            };
        }
        SeqCheck::Seeded | SeqCheck::InOrder => {}
    }

    let apply_started = Instant::now();
    // Below-notional trades advance the sequence but never touch state.
    if trade.notional() >= min_notional_usdt {
        let mut writable = state.lock();
        writable.apply_trade(trade, timeframe);
    }
    let apply_us = apply_started.elapsed().as_micros().min(u32::MAX as u128) as u32;

    telemetry.set_last_agg_id(trade.agg_id);

    let raw_ms = now_unix_ms().saturating_sub(trade.event_time);
    let adjusted_ms = clock::adjusted_network_latency_ms(raw_ms, telemetry.clock_offset_ms());
    telemetry.set_network_latencies(raw_ms, adjusted_ms);

    let local_ms = received_at.elapsed().as_millis().min(u32::MAX as u128) as u32;
    telemetry.set_local_pipeline_latency_ms(i64::from(local_ms));
    perf.record_ingest(parse_us, apply_us, local_ms);

    IngestOutcome::Applied
}

enum Directive {
    Continue,
    Reconnect,
    Fatal(String),
    Cancelled,
}

enum ResyncOutcome {
    Resynced,
    Fatal(String),
    Cancelled,
}

/// Live websocket producer. Owns the connection, the sequence guard and the
/// reconnect/resync protocol; runs until cancelled or fatally rejected.
pub(crate) async fn run(ctx: ProducerContext) -> ProducerExit {
    let market = ctx.config.market_kind;
    let url = adapter::ws_url(market, &ctx.config.symbol);
    let domain = adapter::ws_domain(market);

    let mut guard = SequenceGuard::default();
    let mut parse_errors = ParseErrorWindow::new();
    let mut backoff = resilience::reconnect_backoff();
    let mut first_attempt = true;

    loop {
        if ctx.cancel.is_cancelled() {
            return ProducerExit::Cancelled;
        }

        if first_attempt {
            ctx.status.publish(
                ConnectionState::Connecting,
                Some("opening websocket stream".to_string()),
            );
        } else {
            ctx.status.publish_throttled(
                ConnectionState::Reconnecting,
                Some("reconnecting websocket stream".to_string()),
            );
        }

        let connected = tokio::select! {
            _ = ctx.cancel.cancelled() => return ProducerExit::Cancelled,
            connected = connect::connect_ws(domain, &url) => connected,
        };

        match connected {
            Ok(mut ws) => {
                backoff = resilience::reconnect_backoff();
                let mut live_announced = false;
                let mut exit: Option<ProducerExit> = None;

                loop {
                    let frame = tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            exit = Some(ProducerExit::Cancelled);
                            break;
                        }
                        frame = ws.read_frame() => frame,
                    };

                    match frame {
                        Ok(msg) => match msg.opcode {
                            OpCode::Text | OpCode::Binary => {
                                let directive = handle_frame(
                                    &ctx,
                                    &mut guard,
                                    &mut parse_errors,
                                    &mut live_announced,
                                    &msg.payload[..],
                                )
                                .await;

                                match directive {
                                    Directive::Continue => {}
                                    Directive::Reconnect => break,
                                    Directive::Fatal(reason) => {
                                        exit = Some(ProducerExit::Fatal(reason));
                                        break;
                                    }
                                    Directive::Cancelled => {
                                        exit = Some(ProducerExit::Cancelled);
                                        break;
                                    }
                                }
                            }
                            OpCode::Close => {
                                ctx.status.publish_throttled(
                                    ConnectionState::Reconnecting,
                                    Some("server closed the stream".to_string()),
                                );
                                break;
                            }
                            _ => {}
                        },
                        Err(err) => {
                            ctx.status.publish_throttled(
                                ConnectionState::Reconnecting,
                                Some(format!("websocket read failed: {err}")),
                            );
                            break;
                        }
                    }
                }

                if let Some(exit) = exit {
                    // best-effort close frame
                    let _ = ws.write_frame(Frame::close(1000, b"")).await;
                    return exit;
                }

                first_attempt = false;
            }
            Err(err) if err.is_fatal() => {
                let reason = format!("exchange rejected the stream: {err}");
                ctx.status
                    .publish(ConnectionState::Error, Some(reason.clone()));
                return ProducerExit::Fatal(reason);
            }
            Err(err) => {
                ctx.status.publish_throttled(
                    ConnectionState::Reconnecting,
                    Some(format!("websocket connect failed: {err}")),
                );
                first_attempt = false;
            }
        }

        if let Some(delay) = backoff.next() {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return ProducerExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn handle_frame(
    ctx: &ProducerContext,
    guard: &mut SequenceGuard,
    parse_errors: &mut ParseErrorWindow,
    live_announced: &mut bool,
    payload: &[u8],
) -> Directive {
    let received_at = Instant::now();

    let parse_started = Instant::now();
    let trade = match parse_agg_trade(payload) {
        Ok(trade) => trade,
        Err(err) => {
            log::warn!("dropping undecodable aggTrade frame: {err}");
            if parse_errors.record(Instant::now()) {
                let reason = format!("malformed frame rate exceeded: {err}");
                ctx.status
                    .publish(ConnectionState::Error, Some(reason.clone()));
                return Directive::Fatal(reason);
            }
            return Directive::Continue;
        }
    };
    let parse_us = parse_started.elapsed().as_micros().min(u32::MAX as u128) as u32;

    if !*live_announced {
        *live_announced = true;
        ctx.status.publish(
            ConnectionState::Live,
            Some("websocket stream live".to_string()),
        );
    }

    let outcome = ingest_trade(
        &ctx.state,
        &ctx.telemetry,
        &ctx.perf,
        guard,
        ctx.config.timeframe,
        ctx.flags.min_notional_usdt(),
        &trade,
        received_at,
        parse_us,
    );

    match outcome {
        IngestOutcome::Applied | IngestOutcome::Stale => Directive::Continue,
        IngestOutcome::Gap {
            expected,
            found,
            missed,
        } => {
            ctx.status.publish(
                ConnectionState::Desynced,
                Some(format!(
                    "aggTrade gap detected (expected {expected}, found {found}, missed={missed})"
                )),
            );

            match resync(ctx, guard).await {
                ResyncOutcome::Resynced => Directive::Reconnect,
                ResyncOutcome::Fatal(reason) => Directive::Fatal(reason),
                ResyncOutcome::Cancelled => Directive::Cancelled,
            }
        }
    }
}

/// Re-seeds the sequence from the REST aggTrades snapshot. The caller drops
/// the websocket and reconnects once this returns `Resynced`.
async fn resync(ctx: &ProducerContext, guard: &mut SequenceGuard) -> ResyncOutcome {
    let mut backoff = resilience::reconnect_backoff();

    loop {
        if ctx.cancel.is_cancelled() {
            return ResyncOutcome::Cancelled;
        }

        let fetched = tokio::select! {
            _ = ctx.cancel.cancelled() => return ResyncOutcome::Cancelled,
            fetched = adapter::fetch_last_agg_trade(
                &ctx.http,
                ctx.config.market_kind,
                &ctx.config.symbol,
            ) => fetched,
        };

        match fetched {
            Ok(snapshot) => {
                guard.reset_to(snapshot.agg_id);
                ctx.telemetry.set_last_agg_id(snapshot.agg_id);
                ctx.status.publish(
                    ConnectionState::Reconnecting,
                    Some(format!("sequence reset to aggTrade {}", snapshot.agg_id)),
                );
                return ResyncOutcome::Resynced;
            }
            Err(err) if err.is_fatal() => {
                let reason = format!("snapshot resync rejected: {err}");
                ctx.status
                    .publish(ConnectionState::Error, Some(reason.clone()));
                return ResyncOutcome::Fatal(reason);
            }
            Err(err) => {
                ctx.status.publish_throttled(
                    ConnectionState::Reconnecting,
                    Some(format!("snapshot resync failed: {err}")),
                );
                if let Some(delay) = backoff.next() {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return ResyncOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

/// Deterministic local generator standing in for the websocket: alternating
/// aggressor side, monotonic aggregate ids, gentle price walk.
pub(crate) async fn run_mock(ctx: ProducerContext) -> ProducerExit {
    ctx.status.publish(
        ConnectionState::Connecting,
        Some("starting deterministic mock stream".to_string()),
    );
    ctx.status.publish(
        ConnectionState::Live,
        Some("mock stream live".to_string()),
    );

    let mut guard = SequenceGuard::default();
    let mut agg_id = 0_u64;
    let mut price = 100_000.0_f64;

    let mut ticker = tokio::time::interval(MOCK_TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return ProducerExit::Cancelled,
            _ = ticker.tick() => {
                agg_id += 1;
                let upward = agg_id % 2 == 0;
                price += if upward { 0.6 } else { -0.4 };
                let qty = 0.12 + (agg_id % 5) as f64 * 0.01;
                let now_ms = now_unix_ms();

                let trade = AggTrade {
                    event_time: now_ms,
                    agg_id,
                    price,
                    qty,
                    trade_time: now_ms,
                    is_buyer_maker: !upward,
                };

                let _ = ingest_trade(
                    &ctx.state,
                    &ctx.telemetry,
                    &ctx.perf,
                    &mut guard,
                    ctx.config.timeframe,
                    ctx.flags.min_notional_usdt(),
                    &trade,
                    Instant::now(),
                    0,
                );
            }
        }
    }
}
