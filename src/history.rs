use crate::conflation::ConflatedState;
use crate::event::{
    CandlesBootstrap, DeltaCandlesBootstrap, EventSink, HistoryLoadProgress, MarketEvent,
};
use crate::now_unix_ms;
use crate::session::StreamConfig;
use crate::telemetry::StatusChannel;

use exchange::adapter::{self, MAX_KLINES_PER_REQUEST};
use exchange::{AdapterError, Candle, ConnectionState, DeltaCandle, Timeframe};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

pub(crate) struct HistoryContext {
    pub config: Arc<StreamConfig>,
    pub http: reqwest::Client,
    pub state: Arc<Mutex<ConflatedState>>,
    pub status: Arc<StatusChannel>,
    pub sink: EventSink,
    pub cancel: CancellationToken,
}

/// Loads the bootstrap candles, seeds the live state with the newest bucket,
/// and emits the bootstrap events. Failures degrade to a status reason; the
/// live stream is never torn down over missing history.
pub(crate) async fn run(ctx: HistoryContext) {
    if ctx.cancel.is_cancelled() {
        return;
    }

    let loaded = if ctx.config.mock_mode {
        Ok(mock_history(
            ctx.config.timeframe,
            ctx.config.history_limit,
            now_unix_ms(),
        ))
    } else {
        load(&ctx).await
    };

    match loaded {
        Ok((candles, delta_candles)) => {
            if ctx.cancel.is_cancelled() {
                return;
            }

            {
                let mut writable = ctx.state.lock();
                writable.seed_history(&candles, &delta_candles);
            }

            ctx.sink.publish(MarketEvent::CandlesBootstrap(CandlesBootstrap {
                market_kind: ctx.config.market_kind,
                symbol: ctx.config.symbol.clone(),
                timeframe: ctx.config.timeframe,
                candles,
            }));
            ctx.sink
                .publish(MarketEvent::DeltaCandlesBootstrap(DeltaCandlesBootstrap {
                    market_kind: ctx.config.market_kind,
                    symbol: ctx.config.symbol.clone(),
                    timeframe: ctx.config.timeframe,
                    candles: delta_candles,
                }));

            ctx.status.publish(
                operational_state(ctx.status.state()),
                Some("historical candles loaded".to_string()),
            );
        }
        Err(err) => {
            log::warn!("history load failed: {err}");
            ctx.status.publish(
                operational_state(ctx.status.state()),
                Some(format!("historical candles unavailable: {err}")),
            );
        }
    }
}

/// The stream keeps whatever operational state it is in; anything else reads
/// as still connecting while bootstrap work completes.
fn operational_state(state: ConnectionState) -> ConnectionState {
    match state {
        ConnectionState::Live
        | ConnectionState::Reconnecting
        | ConnectionState::Desynced
        | ConnectionState::Error => state,
        _ => ConnectionState::Connecting,
    }
}

/// Pages backwards from the newest kline (`endTime = oldest - 1`) until the
/// target is met, a short page signals the beginning of listing, or the
/// exchange stops making progress.
async fn load(ctx: &HistoryContext) -> Result<(Vec<Candle>, Vec<DeltaCandle>), AdapterError> {
    let config = &ctx.config;
    let target = if config.history_all {
        None
    } else {
        Some(config.history_limit as usize)
    };

    let oldest_known = if config.history_all {
        adapter::fetch_oldest_kline_open_time(
            &ctx.http,
            config.market_kind,
            &config.symbol,
            config.timeframe,
        )
        .await?
    } else {
        None
    };

    let timeframe_ms = config.timeframe.to_milliseconds().max(1);
    let mut candles_rev: Vec<Candle> = Vec::new();
    let mut delta_candles_rev: Vec<DeltaCandle> = Vec::new();
    let mut end_time: Option<i64> = None;
    let mut previous_oldest: Option<i64> = None;
    let mut newest_seen: Option<i64> = None;
    let mut pages_fetched: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let request_limit = next_request_limit(target, candles_rev.len());
        if request_limit == 0 {
            break;
        }

        let page = adapter::fetch_klines(
            &ctx.http,
            config.market_kind,
            &config.symbol,
            config.timeframe,
            end_time,
            request_limit,
        )
        .await?;

        if page.is_empty() {
            break;
        }

        let oldest_open = page.candles[0].time;
        if newest_seen.is_none() {
            newest_seen = page.candles.last().map(|candle| candle.time);
        }
        let received = page.len();
        pages_fetched = pages_fetched.saturating_add(1);

        for (candle, delta) in page
            .candles
            .into_iter()
            .zip(page.delta_candles)
            .rev()
        {
            candles_rev.push(candle);
            delta_candles_rev.push(delta);
        }

        if config.history_all {
            let (estimated_total_candles, progress_pct) = estimate_progress(
                oldest_known,
                newest_seen,
                oldest_open,
                timeframe_ms,
                false,
            );
            ctx.sink
                .publish(MarketEvent::HistoryProgress(HistoryLoadProgress {
                    market_kind: config.market_kind,
                    symbol: config.symbol.clone(),
                    timeframe: config.timeframe,
                    pages_fetched,
                    candles_fetched: candles_rev.len() as u64,
                    estimated_total_candles,
                    progress_pct,
                    done: false,
                }));
        }

        if let Some(target) = target
            && candles_rev.len() >= target
        {
            break;
        }
        if received < request_limit as usize {
            break;
        }
        if let Some(previous) = previous_oldest
            && oldest_open >= previous
        {
            break;
        }
        if oldest_open <= 0 {
            break;
        }

        previous_oldest = Some(oldest_open);
        end_time = Some(oldest_open - 1);
    }

    if let Some(target) = target {
        candles_rev.truncate(target);
        delta_candles_rev.truncate(target);
    }

    if config.history_all && !ctx.cancel.is_cancelled() {
        let (estimated_total_candles, progress_pct) = estimate_progress(
            oldest_known,
            newest_seen,
            oldest_known.unwrap_or_default(),
            timeframe_ms,
            true,
        );
        ctx.sink
            .publish(MarketEvent::HistoryProgress(HistoryLoadProgress {
                market_kind: config.market_kind,
                symbol: config.symbol.clone(),
                timeframe: config.timeframe,
                pages_fetched,
                candles_fetched: candles_rev.len() as u64,
                estimated_total_candles,
                progress_pct,
                done: true,
            }));
    }

    candles_rev.reverse();
    delta_candles_rev.reverse();

    Ok((candles_rev, delta_candles_rev))
}

fn next_request_limit(target: Option<usize>, fetched: usize) -> u16 {
    match target {
        Some(target) => target
            .saturating_sub(fetched)
            .min(MAX_KLINES_PER_REQUEST as usize) as u16,
        None => MAX_KLINES_PER_REQUEST,
    }
}

/// Total-candle estimate and percent covered, both from the symbol's oldest
/// listed bucket. `None` when the listing bound is unknown.
fn estimate_progress(
    oldest_known: Option<i64>,
    newest_seen: Option<i64>,
    oldest_fetched: i64,
    timeframe_ms: i64,
    done: bool,
) -> (Option<u64>, Option<f64>) {
    let estimated_total = oldest_known.and_then(|oldest| {
        newest_seen.and_then(|newest| {
            if newest < oldest {
                return None;
            }
            let total = ((newest - oldest) / timeframe_ms) + 1;
            u64::try_from(total).ok()
        })
    });

    let progress_pct = if done {
        Some(100.0)
    } else if let (Some(oldest), Some(newest)) = (oldest_known, newest_seen) {
        if newest < oldest {
            None
        } else {
            let total_span = (newest - oldest + timeframe_ms).max(1);
            let covered_span = (newest - oldest_fetched + timeframe_ms).max(0);
            let pct = (covered_span as f64 / total_span as f64) * 100.0;
            Some(pct.clamp(0.0, 99.9))
        }
    } else {
        None
    };

    (estimated_total, progress_pct)
}

/// Deterministic offline history for mock sessions: aligned buckets ending at
/// the current one, gentle drift, bounded volumes.
pub(crate) fn mock_history(
    timeframe: Timeframe,
    history_limit: u32,
    now_ms: i64,
) -> (Vec<Candle>, Vec<DeltaCandle>) {
    let timeframe_ms = timeframe.to_milliseconds();
    let aligned_now = timeframe.bucket_open_ms(now_ms);
    let start = aligned_now - (history_limit as i64 * timeframe_ms);

    let mut candles = Vec::with_capacity(history_limit as usize);
    let mut delta_candles = Vec::with_capacity(history_limit as usize);
    let mut price = 100_000.0_f64;

    for step in 0..history_limit {
        let open_time = start + step as i64 * timeframe_ms;
        let drift = ((step % 7) as f64 - 3.0) * 2.1;
        let open = price;
        let close = (open + drift).max(1.0);
        let volume = 2.0 + (step % 5) as f64 * 0.3;

        candles.push(Candle {
            time: open_time,
            open,
            high: open.max(close) + 1.25,
            low: open.min(close) - 1.1,
            close,
            volume,
        });

        let direction = if step % 2 == 0 { 1.0 } else { -1.0 };
        let net_delta = direction * (1.0 + (step % 7) as f64 * 0.35);
        delta_candles.push(DeltaCandle::from_net_delta(open_time, net_delta, volume));

        price = close;
    }

    (candles, delta_candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_limit_caps_at_page_size_and_target() {
        assert_eq!(next_request_limit(None, 0), 1_000);
        assert_eq!(next_request_limit(None, 999_999), 1_000);
        assert_eq!(next_request_limit(Some(2_237), 0), 1_000);
        assert_eq!(next_request_limit(Some(2_237), 2_000), 237);
        assert_eq!(next_request_limit(Some(2_237), 2_237), 0);
        assert_eq!(next_request_limit(Some(10), 3), 7);
    }

    #[test]
    fn progress_estimates_totals_from_listing_bound() {
        let timeframe_ms = 60_000;
        // listing starts at 0, newest bucket at 99 minutes: 100 candles total
        let (total, pct) = estimate_progress(Some(0), Some(99 * 60_000), 40 * 60_000, timeframe_ms, false);
        assert_eq!(total, Some(100));
        let pct = pct.expect("pct computable");
        assert!((pct - 60.0).abs() < 1.0, "pct was {pct}");

        let (_, done_pct) = estimate_progress(Some(0), Some(99 * 60_000), 0, timeframe_ms, true);
        assert_eq!(done_pct, Some(100.0));
    }

    #[test]
    fn progress_is_unknown_without_listing_bound() {
        let (total, pct) = estimate_progress(None, Some(60_000), 0, 60_000, false);
        assert_eq!(total, None);
        assert_eq!(pct, None);
    }

    #[test]
    fn undone_progress_never_reports_complete() {
        let (_, pct) = estimate_progress(Some(0), Some(600_000), 0, 60_000, false);
        assert!(pct.expect("pct computable") <= 99.9);
    }

    #[test]
    fn mock_history_is_aligned_and_sized() {
        let (candles, deltas) = mock_history(Timeframe::M1, 50, 1_736_954_321_987);

        assert_eq!(candles.len(), 50);
        assert_eq!(deltas.len(), 50);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].time - pair[0].time, 60_000);
        }
        for candle in &candles {
            assert_eq!(candle.time % 60_000, 0);
            assert!(candle.low <= candle.open.min(candle.close));
            assert!(candle.high >= candle.open.max(candle.close));
            assert!(candle.volume >= 0.0);
        }
        for delta in &deltas {
            assert!(delta.low <= delta.close && delta.close <= delta.high);
            assert!((delta.close - delta.open).abs() <= delta.volume);
        }
    }
}
