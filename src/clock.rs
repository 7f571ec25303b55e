use crate::now_unix_ms;
use crate::telemetry::TelemetryAtomics;

use exchange::{AdapterError, MarketKind, adapter};

use tokio_util::sync::CancellationToken;

use std::sync::Arc;
use std::time::Duration;

/// EWMA smoothing factor for the clock offset: 1/4.
const EWMA_DIVISOR: i64 = 4;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ClockProbe {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

/// Exponentially weighted clock offset; the first sample is taken as-is.
#[derive(Debug, Default)]
pub(crate) struct ClockEwma {
    initialized: bool,
    value_ms: i64,
}

impl ClockEwma {
    pub fn update(&mut self, sample_ms: i64) -> i64 {
        if !self.initialized {
            self.value_ms = sample_ms;
            self.initialized = true;
            return self.value_ms;
        }

        let delta = sample_ms.saturating_sub(self.value_ms);
        self.value_ms = self.value_ms.saturating_add(delta / EWMA_DIVISOR);
        self.value_ms
    }
}

/// Converts the local receive delta into server-clock latency.
/// `raw = now_local - event_time_server`; adding the (server - local) offset
/// yields `now_server - event_time_server`, clamped at zero for jitter.
pub(crate) fn adjusted_network_latency_ms(raw_ms: i64, clock_offset_ms: Option<i64>) -> i64 {
    let adjusted = match clock_offset_ms {
        Some(offset) => raw_ms.saturating_add(offset),
        None => raw_ms,
    };
    adjusted.max(0)
}

/// Deterministic ±10% jitter around the configured interval, salted with the
/// wall clock so repeated sessions do not align on the server.
pub(crate) fn jittered_interval_ms(base_ms: u64, salt: i64) -> u64 {
    let spread = base_ms / 5;
    if spread == 0 {
        return base_ms;
    }
    let offset = salt.unsigned_abs() % (spread + 1);
    base_ms - base_ms / 10 + offset
}

/// One server-time round trip. The offset is measured against the local
/// midpoint of the request, halving the RTT skew.
async fn probe_offset(
    client: &reqwest::Client,
    market: MarketKind,
) -> Result<ClockProbe, AdapterError> {
    let started_ms = now_unix_ms();
    let server_time_ms = adapter::fetch_server_time(client, market).await?;
    let finished_ms = now_unix_ms();

    let rtt_ms = finished_ms.saturating_sub(started_ms).max(0);
    let local_midpoint_ms = started_ms.saturating_add(rtt_ms / 2);

    Ok(ClockProbe {
        offset_ms: server_time_ms.saturating_sub(local_midpoint_ms),
        rtt_ms,
    })
}

/// Periodic clock sync task. Failed probes keep the previous offset; the
/// schedule is re-jittered after every attempt.
pub(crate) async fn run(
    client: reqwest::Client,
    market: MarketKind,
    base_interval_ms: u64,
    telemetry: Arc<TelemetryAtomics>,
    cancel: CancellationToken,
) {
    let mut ewma = ClockEwma::default();
    let mut next_delay_ms = 0_u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(next_delay_ms)) => {
                match probe_offset(&client, market).await {
                    Ok(probe) => {
                        let smoothed = ewma.update(probe.offset_ms);
                        telemetry.set_clock_offset_ms(smoothed);
                        log::debug!(
                            "clock sync: offset={}ms (sample {}ms, rtt {}ms)",
                            smoothed,
                            probe.offset_ms,
                            probe.rtt_ms
                        );
                    }
                    Err(err) => {
                        log::warn!("clock sync probe failed: {err}");
                    }
                }
                next_delay_ms = jittered_interval_ms(base_interval_ms, now_unix_ms());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_stored_as_is() {
        let mut ewma = ClockEwma::default();
        assert_eq!(ewma.update(-480), -480);
    }

    #[test]
    fn ewma_settles_within_four_samples_after_a_step() {
        let mut ewma = ClockEwma::default();
        ewma.update(0);

        let mut value = 0;
        for _ in 0..4 {
            value = ewma.update(100);
        }
        // alpha = 0.25: residual after four samples is under a third of the step
        assert!(value >= 60, "offset only reached {value}");
        assert!(value <= 100);
    }

    #[test]
    fn ewma_tracks_negative_offsets() {
        let mut ewma = ClockEwma::default();
        ewma.update(0);
        let mut value = 0;
        for _ in 0..8 {
            value = ewma.update(-200);
        }
        assert!(value <= -150);
    }

    #[test]
    fn adjusted_latency_applies_offset_and_clamps() {
        // local clock 650ms behind the server: raw delta is negative
        assert_eq!(adjusted_network_latency_ms(-600, Some(650)), 50);
        assert_eq!(adjusted_network_latency_ms(-80, Some(10)), 0);
        assert_eq!(adjusted_network_latency_ms(120, None), 120);
        assert_eq!(adjusted_network_latency_ms(-5, None), 0);
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = 30_000;
        for salt in [0_i64, 1, 999, 12_345, -777, i64::MAX] {
            let delay = jittered_interval_ms(base, salt);
            assert!(delay >= base - base / 10, "delay {delay} below -10%");
            assert!(delay <= base + base / 10, "delay {delay} above +10%");
        }
        // degenerate base falls through untouched
        assert_eq!(jittered_interval_ms(3, 42), 3);
    }
}
