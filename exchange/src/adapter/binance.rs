use super::{AdapterError, MarketKind, kline_to_pair};
use crate::{Candle, DeltaCandle, Timeframe, de_string_to_f64, resilience};

use serde::Deserialize;
use serde::de::DeserializeOwned;

use std::time::Duration;

const SPOT_REST_DOMAIN: &str = "https://api.binance.com";
const FUTURES_USDM_REST_DOMAIN: &str = "https://fapi.binance.com";

const SERVER_TIME_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard page cap enforced by the klines endpoint.
pub const MAX_KLINES_PER_REQUEST: u16 = 1_000;

pub fn ws_domain(market: MarketKind) -> &'static str {
    match market {
        MarketKind::Spot => "stream.binance.com",
        MarketKind::FuturesUsdm => "fstream.binance.com",
    }
}

pub fn ws_url(market: MarketKind, symbol: &str) -> String {
    let stream = symbol.to_ascii_lowercase();
    match market {
        MarketKind::Spot => format!("wss://stream.binance.com:9443/ws/{stream}@aggTrade"),
        MarketKind::FuturesUsdm => format!("wss://fstream.binance.com/ws/{stream}@aggTrade"),
    }
}

fn rest_base(market: MarketKind) -> String {
    match market {
        MarketKind::Spot => format!("{SPOT_REST_DOMAIN}/api/v3"),
        MarketKind::FuturesUsdm => format!("{FUTURES_USDM_REST_DOMAIN}/fapi/v1"),
    }
}

fn server_time_url(market: MarketKind) -> String {
    format!("{}/time", rest_base(market))
}

fn agg_trade_snapshot_url(market: MarketKind, symbol: &str) -> String {
    format!(
        "{}/aggTrades?symbol={}&limit=1",
        rest_base(market),
        symbol.to_ascii_uppercase()
    )
}

fn klines_url(
    market: MarketKind,
    symbol: &str,
    timeframe: Timeframe,
    end_time: Option<i64>,
    limit: u16,
) -> String {
    let mut url = format!(
        "{}/klines?symbol={}&interval={}&limit={limit}",
        rest_base(market),
        symbol.to_ascii_uppercase(),
        timeframe
    );
    if let Some(end_time) = end_time {
        url.push_str(&format!("&endTime={end_time}"));
    }
    url
}

fn symbols_url(market: MarketKind) -> String {
    match market {
        MarketKind::Spot => format!("{}/exchangeInfo?permissions=SPOT", rest_base(market)),
        MarketKind::FuturesUsdm => format!("{}/exchangeInfo", rest_base(market)),
    }
}

async fn try_get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    timeout: Option<Duration>,
) -> Result<T, AdapterError> {
    let mut request = client.get(url);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }

    let response = request.send().await?;
    let status = response.status();
    if status.is_client_error() {
        return Err(AdapterError::InvalidRequest(format!("{status} from {url}")));
    }
    let response = response.error_for_status()?;

    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::ParseError(e.to_string()))
}

/// GET + JSON decode under the REST retry policy. Transient faults and 5xx
/// retry on the backoff curve; 4xx and undecodable payloads fail fast.
async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    timeout: Option<Duration>,
) -> Result<T, AdapterError> {
    let mut backoff = resilience::rest_backoff();

    loop {
        match try_get_json::<T>(client, url, timeout).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() => match backoff.next() {
                Some(delay) => {
                    log::warn!("retrying {url} after {delay:?}: {err}");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        }
    }
}

#[derive(Deserialize)]
struct ServerTimeWire {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

pub async fn fetch_server_time(
    client: &reqwest::Client,
    market: MarketKind,
) -> Result<i64, AdapterError> {
    let wire: ServerTimeWire = get_json(
        client,
        &server_time_url(market),
        Some(SERVER_TIME_TIMEOUT),
    )
    .await?;
    Ok(wire.server_time)
}

#[derive(Deserialize)]
struct AggTradeSnapshotWire {
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p", deserialize_with = "de_string_to_f64")]
    price: f64,
}

/// Most recent aggregated trade on the symbol, used to re-seed the sequence
/// after a gap.
#[derive(Debug, Clone, Copy)]
pub struct LastAggTrade {
    pub agg_id: u64,
    pub price: f64,
}

pub async fn fetch_last_agg_trade(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
) -> Result<LastAggTrade, AdapterError> {
    let url = agg_trade_snapshot_url(market, symbol);
    let page: Vec<AggTradeSnapshotWire> = get_json(client, &url, None).await?;

    let latest = page
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::ParseError("empty aggTrades snapshot".to_string()))?;

    if !latest.price.is_finite() {
        return Err(AdapterError::ParseError(
            "snapshot price must be finite".to_string(),
        ));
    }

    Ok(LastAggTrade {
        agg_id: latest.agg_id,
        price: latest.price,
    })
}

// Positional kline row: [openTime, open, high, low, close, volume, closeTime,
// quoteVolume, tradeCount, takerBuyBase, takerBuyQuote, unused]. Numerics
// arrive as quoted decimal strings.
#[derive(Deserialize, Debug, Clone)]
#[allow(dead_code)]
struct FetchedKline(
    i64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    i64,
    String,
    u64,
    #[serde(deserialize_with = "de_string_to_f64")] f64,
    String,
    String,
);

/// One page of historical klines, oldest first, with the delta candles
/// derived from the taker-buy volume column.
#[derive(Debug, Clone, Default)]
pub struct KlinePage {
    pub candles: Vec<Candle>,
    pub delta_candles: Vec<DeltaCandle>,
}

impl KlinePage {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

pub async fn fetch_klines(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
    timeframe: Timeframe,
    end_time: Option<i64>,
    limit: u16,
) -> Result<KlinePage, AdapterError> {
    let url = klines_url(market, symbol, timeframe, end_time, limit);
    let rows: Vec<FetchedKline> = get_json(client, &url, None).await?;

    let mut page = KlinePage {
        candles: Vec::with_capacity(rows.len()),
        delta_candles: Vec::with_capacity(rows.len()),
    };

    for row in rows {
        let FetchedKline(time, open, high, low, close, volume, .., taker_buy_volume, _, _) = row;

        if ![open, high, low, close, volume, taker_buy_volume]
            .iter()
            .all(|v| v.is_finite())
            || volume < 0.0
            || taker_buy_volume < 0.0
        {
            return Err(AdapterError::ParseError(
                "kline values must be finite with non-negative volume".to_string(),
            ));
        }

        let candle = Candle {
            time,
            open,
            high,
            low,
            close,
            volume,
        };
        let (candle, delta) = kline_to_pair(candle, taker_buy_volume);
        page.candles.push(candle);
        page.delta_candles.push(delta);
    }

    Ok(page)
}

/// Open time of the very first kline the exchange has for the symbol.
/// Drives the total-candle estimate of paginated history loads.
pub async fn fetch_oldest_kline_open_time(
    client: &reqwest::Client,
    market: MarketKind,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<Option<i64>, AdapterError> {
    let mut url = klines_url(market, symbol, timeframe, None, 1);
    url.push_str("&startTime=0");

    let rows: Vec<FetchedKline> = get_json(client, &url, None).await?;
    Ok(rows.first().map(|row| row.0))
}

#[derive(Deserialize)]
struct SpotExchangeInfoWire {
    symbols: Vec<SpotSymbolWire>,
}

#[derive(Deserialize)]
struct SpotSymbolWire {
    symbol: String,
    status: String,
    #[serde(rename = "isSpotTradingAllowed")]
    is_spot_trading_allowed: bool,
}

#[derive(Deserialize)]
struct FuturesExchangeInfoWire {
    symbols: Vec<FuturesSymbolWire>,
}

#[derive(Deserialize)]
struct FuturesSymbolWire {
    symbol: String,
    status: String,
    #[serde(rename = "contractType")]
    contract_type: String,
}

pub async fn fetch_symbols(
    client: &reqwest::Client,
    market: MarketKind,
) -> Result<Vec<String>, AdapterError> {
    let url = symbols_url(market);

    let mut symbols: Vec<String> = match market {
        MarketKind::Spot => {
            let info: SpotExchangeInfoWire = get_json(client, &url, None).await?;
            info.symbols
                .into_iter()
                .filter(|entry| {
                    entry.is_spot_trading_allowed && entry.status.eq_ignore_ascii_case("TRADING")
                })
                .map(|entry| entry.symbol)
                .collect()
        }
        MarketKind::FuturesUsdm => {
            let info: FuturesExchangeInfoWire = get_json(client, &url, None).await?;
            info.symbols
                .into_iter()
                .filter(|entry| {
                    entry.status.eq_ignore_ascii_case("TRADING")
                        && entry.contract_type.eq_ignore_ascii_case("PERPETUAL")
                })
                .map(|entry| entry.symbol)
                .collect()
        }
    };

    symbols.sort_unstable();
    symbols.dedup();
    Ok(symbols)
}
