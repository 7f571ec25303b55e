use crate::EngineError;

use exchange::{MarketKind, Timeframe, normalize_symbol};

use serde::{Deserialize, Serialize};

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const DEFAULT_SYMBOL: &str = "BTCUSDT";
pub const DEFAULT_MIN_NOTIONAL_USDT: f64 = 100.0;
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 8;
pub const DEFAULT_CLOCK_SYNC_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HISTORY_LIMIT: u32 = 1_000;
pub const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M1;

pub const EMIT_INTERVAL_RANGE_MS: RangeInclusive<u64> = 8..=1_000;
pub const CLOCK_SYNC_INTERVAL_RANGE_MS: RangeInclusive<u64> = 5_000..=300_000;
pub const HISTORY_LIMIT_RANGE: RangeInclusive<u32> = 1..=2_000_000;

/// Whether the websocket opens before or after the first history page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    #[default]
    LiveFirst,
    HistoryFirst,
}

/// Raw `start_market_stream` arguments; every field optional, defaults and
/// clamping applied by [`StartStreamArgs::normalize`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartStreamArgs {
    pub market_kind: Option<MarketKind>,
    pub symbol: Option<String>,
    pub min_notional_usdt: Option<f64>,
    pub emit_interval_ms: Option<u64>,
    pub mock_mode: Option<bool>,
    pub emit_legacy_price_event: Option<bool>,
    pub emit_legacy_frame_events: Option<bool>,
    pub perf_telemetry: Option<bool>,
    pub clock_sync_interval_ms: Option<u64>,
    pub timeframe: Option<Timeframe>,
    pub startup_mode: Option<StartupMode>,
    pub history_limit: Option<u32>,
    pub history_all: Option<bool>,
}

/// Realized stream configuration after defaulting and clamping.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub min_notional_usdt: f64,
    pub emit_interval_ms: u64,
    pub mock_mode: bool,
    pub emit_legacy_price_event: bool,
    pub emit_legacy_frame_events: bool,
    pub perf_telemetry: bool,
    pub clock_sync_interval_ms: u64,
    pub timeframe: Timeframe,
    pub startup_mode: StartupMode,
    pub history_limit: u32,
    pub history_all: bool,
}

impl StreamConfig {
    /// One pipeline per (marketKind, symbol, timeframe); a start matching the
    /// running identity refreshes flags instead of replacing the session.
    pub fn same_stream(&self, other: &StreamConfig) -> bool {
        self.market_kind == other.market_kind
            && self.symbol == other.symbol
            && self.timeframe == other.timeframe
    }
}

impl StartStreamArgs {
    pub fn normalize(self) -> Result<StreamConfig, EngineError> {
        let market_kind = self.market_kind.unwrap_or_default();
        let symbol = normalize_symbol(&self.symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string()))
            .map_err(EngineError::InvalidArgs)?;

        let min_notional_usdt = self.min_notional_usdt.unwrap_or(DEFAULT_MIN_NOTIONAL_USDT);
        if !min_notional_usdt.is_finite() || min_notional_usdt < 0.0 {
            return Err(EngineError::InvalidArgs(
                "minNotionalUsdt must be a finite non-negative number".to_string(),
            ));
        }

        let emit_interval_ms = self
            .emit_interval_ms
            .unwrap_or(DEFAULT_EMIT_INTERVAL_MS)
            .clamp(*EMIT_INTERVAL_RANGE_MS.start(), *EMIT_INTERVAL_RANGE_MS.end());
        let clock_sync_interval_ms = self
            .clock_sync_interval_ms
            .unwrap_or(DEFAULT_CLOCK_SYNC_INTERVAL_MS)
            .clamp(
                *CLOCK_SYNC_INTERVAL_RANGE_MS.start(),
                *CLOCK_SYNC_INTERVAL_RANGE_MS.end(),
            );
        let history_limit = self
            .history_limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(*HISTORY_LIMIT_RANGE.start(), *HISTORY_LIMIT_RANGE.end());

        Ok(StreamConfig {
            market_kind,
            symbol,
            min_notional_usdt,
            emit_interval_ms,
            mock_mode: self.mock_mode.unwrap_or(false),
            emit_legacy_price_event: self.emit_legacy_price_event.unwrap_or(false),
            emit_legacy_frame_events: self.emit_legacy_frame_events.unwrap_or(false),
            perf_telemetry: self.perf_telemetry.unwrap_or(false),
            clock_sync_interval_ms,
            timeframe: self.timeframe.unwrap_or(DEFAULT_TIMEFRAME),
            startup_mode: self.startup_mode.unwrap_or_default(),
            history_limit,
            history_all: self.history_all.unwrap_or(false),
        })
    }
}

/// Session echo returned by `start_market_stream`, with defaults realized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub running: bool,
    pub market_kind: MarketKind,
    pub symbol: String,
    pub min_notional_usdt: f64,
    pub emit_interval_ms: u64,
    pub mock_mode: bool,
    pub emit_legacy_price_event: bool,
    pub emit_legacy_frame_events: bool,
    pub perf_telemetry: bool,
    pub clock_sync_interval_ms: u64,
    pub timeframe: Timeframe,
    pub startup_mode: StartupMode,
    pub history_limit: u32,
    pub history_all: bool,
}

impl Session {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            running: true,
            market_kind: config.market_kind,
            symbol: config.symbol.clone(),
            min_notional_usdt: config.min_notional_usdt,
            emit_interval_ms: config.emit_interval_ms,
            mock_mode: config.mock_mode,
            emit_legacy_price_event: config.emit_legacy_price_event,
            emit_legacy_frame_events: config.emit_legacy_frame_events,
            perf_telemetry: config.perf_telemetry,
            clock_sync_interval_ms: config.clock_sync_interval_ms,
            timeframe: config.timeframe,
            startup_mode: config.startup_mode,
            history_limit: config.history_limit,
            history_all: config.history_all,
        }
    }

    /// Applies the live-refreshable subset when a start call matches the
    /// running stream identity.
    pub fn refresh_flags(&mut self, config: &StreamConfig) {
        self.min_notional_usdt = config.min_notional_usdt;
        self.emit_legacy_price_event = config.emit_legacy_price_event;
        self.emit_legacy_frame_events = config.emit_legacy_frame_events;
        self.perf_telemetry = config.perf_telemetry;
    }
}

/// Flag set the running tasks re-read on every use, so a same-identity start
/// updates behavior without restarting the websocket.
#[derive(Debug)]
pub struct SharedFlags {
    min_notional_bits: AtomicU64,
    emit_legacy_price_event: AtomicBool,
    emit_legacy_frame_events: AtomicBool,
    perf_telemetry: AtomicBool,
}

impl SharedFlags {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            min_notional_bits: AtomicU64::new(config.min_notional_usdt.to_bits()),
            emit_legacy_price_event: AtomicBool::new(config.emit_legacy_price_event),
            emit_legacy_frame_events: AtomicBool::new(config.emit_legacy_frame_events),
            perf_telemetry: AtomicBool::new(config.perf_telemetry),
        }
    }

    pub fn apply(&self, config: &StreamConfig) {
        self.min_notional_bits
            .store(config.min_notional_usdt.to_bits(), Ordering::Relaxed);
        self.emit_legacy_price_event
            .store(config.emit_legacy_price_event, Ordering::Relaxed);
        self.emit_legacy_frame_events
            .store(config.emit_legacy_frame_events, Ordering::Relaxed);
        self.perf_telemetry
            .store(config.perf_telemetry, Ordering::Relaxed);
    }

    pub fn min_notional_usdt(&self) -> f64 {
        f64::from_bits(self.min_notional_bits.load(Ordering::Relaxed))
    }

    pub fn emit_legacy_price_event(&self) -> bool {
        self.emit_legacy_price_event.load(Ordering::Relaxed)
    }

    pub fn emit_legacy_frame_events(&self) -> bool {
        self.emit_legacy_frame_events.load(Ordering::Relaxed)
    }

    pub fn perf_telemetry(&self) -> bool {
        self.perf_telemetry.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_realized() {
        let config = StartStreamArgs::default()
            .normalize()
            .expect("defaults should normalize");

        assert_eq!(config.market_kind, MarketKind::Spot);
        assert_eq!(config.symbol, DEFAULT_SYMBOL);
        assert_eq!(config.min_notional_usdt, DEFAULT_MIN_NOTIONAL_USDT);
        assert_eq!(config.emit_interval_ms, DEFAULT_EMIT_INTERVAL_MS);
        assert_eq!(config.clock_sync_interval_ms, DEFAULT_CLOCK_SYNC_INTERVAL_MS);
        assert_eq!(config.timeframe, Timeframe::M1);
        assert_eq!(config.startup_mode, StartupMode::LiveFirst);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(!config.history_all);
        assert!(!config.mock_mode);
        assert!(!config.perf_telemetry);
    }

    #[test]
    fn numeric_ranges_clamp_instead_of_rejecting() {
        let config = StartStreamArgs {
            emit_interval_ms: Some(1),
            clock_sync_interval_ms: Some(100),
            history_limit: Some(0),
            ..Default::default()
        }
        .normalize()
        .expect("out-of-range numerics clamp");

        assert_eq!(config.emit_interval_ms, 8);
        assert_eq!(config.clock_sync_interval_ms, 5_000);
        assert_eq!(config.history_limit, 1);

        let config = StartStreamArgs {
            emit_interval_ms: Some(5_000),
            clock_sync_interval_ms: Some(1_000_000),
            history_limit: Some(5_000_000),
            ..Default::default()
        }
        .normalize()
        .expect("clamps at the top end too");

        assert_eq!(config.emit_interval_ms, 1_000);
        assert_eq!(config.clock_sync_interval_ms, 300_000);
        assert_eq!(config.history_limit, 2_000_000);
    }

    #[test]
    fn rejects_bad_symbol_and_notional() {
        let bad_symbol = StartStreamArgs {
            symbol: Some("BTC/USDT".to_string()),
            ..Default::default()
        }
        .normalize();
        assert!(matches!(bad_symbol, Err(EngineError::InvalidArgs(_))));

        let bad_notional = StartStreamArgs {
            min_notional_usdt: Some(f64::NAN),
            ..Default::default()
        }
        .normalize();
        assert!(matches!(bad_notional, Err(EngineError::InvalidArgs(_))));

        let negative = StartStreamArgs {
            min_notional_usdt: Some(-1.0),
            ..Default::default()
        }
        .normalize();
        assert!(matches!(negative, Err(EngineError::InvalidArgs(_))));
    }

    #[test]
    fn symbol_is_uppercased() {
        let config = StartStreamArgs {
            symbol: Some(" ethusdt ".to_string()),
            ..Default::default()
        }
        .normalize()
        .expect("lowercase symbol normalizes");
        assert_eq!(config.symbol, "ETHUSDT");
    }

    #[test]
    fn stream_identity_ignores_flags() {
        let base = StartStreamArgs::default().normalize().expect("valid");
        let flags_changed = StartStreamArgs {
            min_notional_usdt: Some(500.0),
            emit_legacy_price_event: Some(true),
            perf_telemetry: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("valid");
        assert!(base.same_stream(&flags_changed));

        let mock_toggled = StartStreamArgs {
            mock_mode: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("valid");
        assert!(base.same_stream(&mock_toggled));

        let different_tf = StartStreamArgs {
            timeframe: Some(Timeframe::H1),
            ..Default::default()
        }
        .normalize()
        .expect("valid");
        assert!(!base.same_stream(&different_tf));
    }

    #[test]
    fn shared_flags_refresh_in_place() {
        let base = StartStreamArgs::default().normalize().expect("valid");
        let flags = SharedFlags::from_config(&base);
        assert_eq!(flags.min_notional_usdt(), DEFAULT_MIN_NOTIONAL_USDT);
        assert!(!flags.emit_legacy_frame_events());

        let updated = StartStreamArgs {
            min_notional_usdt: Some(1_000.0),
            emit_legacy_frame_events: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("valid");
        flags.apply(&updated);

        assert_eq!(flags.min_notional_usdt(), 1_000.0);
        assert!(flags.emit_legacy_frame_events());
    }

    #[test]
    fn args_parse_from_camel_case_json() {
        let args: StartStreamArgs = serde_json::from_str(
            r#"{"marketKind":"futures_usdm","symbol":"BTCUSDT","emitIntervalMs":16,"historyAll":true,"startupMode":"history_first"}"#,
        )
        .expect("camelCase args parse");

        assert_eq!(args.market_kind, Some(MarketKind::FuturesUsdm));
        assert_eq!(args.emit_interval_ms, Some(16));
        assert_eq!(args.history_all, Some(true));
        assert_eq!(args.startup_mode, Some(StartupMode::HistoryFirst));
    }
}
