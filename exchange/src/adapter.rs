use crate::{Candle, DeltaCandle, Timeframe};

use serde::{Deserialize, Serialize};

use std::str::FromStr;

pub mod binance;

pub use binance::{KlinePage, LastAggTrade, MAX_KLINES_PER_REQUEST};

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    FetchError(#[from] reqwest::Error),
    #[error("Parsing: {0}")]
    ParseError(String),
    #[error("Stream: {0}")]
    WebsocketError(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl AdapterError {
    /// Worth another attempt: network faults, websocket drops, 5xx.
    /// 4xx rejections and payloads we could not make sense of are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            AdapterError::FetchError(err) => {
                !err.status().is_some_and(|status| status.is_client_error())
            }
            AdapterError::WebsocketError(_) => true,
            AdapterError::ParseError(_) | AdapterError::InvalidRequest(_) => false,
        }
    }

    /// Exchange rejected the request outright; reconnecting cannot help.
    pub fn is_fatal(&self) -> bool {
        match self {
            AdapterError::InvalidRequest(_) => true,
            AdapterError::FetchError(err) => {
                err.status().is_some_and(|status| status.is_client_error())
            }
            _ => false,
        }
    }
}

/// Endpoint family. Selected once at session construction; every URL and
/// payload-shape decision dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketKind {
    #[default]
    Spot,
    FuturesUsdm,
}

impl MarketKind {
    pub const ALL: [MarketKind; 2] = [MarketKind::Spot, MarketKind::FuturesUsdm];

    pub fn as_str(self) -> &'static str {
        match self {
            MarketKind::Spot => "spot",
            MarketKind::FuturesUsdm => "futures_usdm",
        }
    }
}

impl std::fmt::Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spot" => Ok(MarketKind::Spot),
            "futures_usdm" => Ok(MarketKind::FuturesUsdm),
            _ => Err(format!("unsupported market kind '{s}'")),
        }
    }
}

pub fn ws_url(market: MarketKind, symbol: &str) -> String {
    binance::ws_url(market, symbol)
}

pub fn ws_domain(market: MarketKind) -> &'static str {
    binance::ws_domain(market)
}

pub async fn fetch_server_time(
    client: &reqwest::Client,
    market: MarketKind,
) -> Result<i64, AdapterError> {
    binance::fetch_server_time(client, market).await
}

pub async fn fetch_last_agg_trade(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
) -> Result<LastAggTrade, AdapterError> {
    binance::fetch_last_agg_trade(client, market, symbol).await
}

pub async fn fetch_klines(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
    timeframe: Timeframe,
    end_time: Option<i64>,
    limit: u16,
) -> Result<KlinePage, AdapterError> {
    binance::fetch_klines(client, market, symbol, timeframe, end_time, limit).await
}

pub async fn fetch_oldest_kline_open_time(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<Option<i64>, AdapterError> {
    binance::fetch_oldest_kline_open_time(client, market, symbol, timeframe).await
}

pub async fn fetch_symbols(
    client: &reqwest::Client,
    market: MarketKind,
) -> Result<Vec<String>, AdapterError> {
    binance::fetch_symbols(client, market).await
}

/// A single historical kline expanded into its candle and the delta candle
/// reconstructed from the taker-buy volume column.
pub fn kline_to_pair(candle: Candle, taker_buy_volume: f64) -> (Candle, DeltaCandle) {
    let net_delta = taker_buy_volume - (candle.volume - taker_buy_volume);
    let delta = DeltaCandle::from_net_delta(candle.time, net_delta, candle.volume);
    (candle, delta)
}
