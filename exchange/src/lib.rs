pub mod adapter;
pub mod connect;
pub mod health;
pub mod resilience;

pub use adapter::{AdapterError, MarketKind};
pub use health::ConnectionState;

use serde::{Deserialize, Serialize};

use std::fmt;

/// OHLCV bucket width. Month is a nominal 30 days, matching the exchange's
/// own bucket alignment for kline requests rather than calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mn1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::Mn1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mn1 => "1M",
        }
    }

    pub fn bucket_seconds(self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
            Timeframe::Mn1 => 2_592_000,
        }
    }

    pub fn to_milliseconds(self) -> i64 {
        self.bucket_seconds() as i64 * 1_000
    }

    /// Open time of the bucket containing `timestamp_ms`.
    pub fn bucket_open_ms(self, timestamp_ms: i64) -> i64 {
        let bucket_ms = self.to_milliseconds();
        timestamp_ms - timestamp_ms.rem_euclid(bucket_ms)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            "1M" => Ok(Timeframe::Mn1),
            _ => Err(format!("unsupported timeframe '{s}'")),
        }
    }
}

/// One aggregated trade as decoded from the `@aggTrade` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AggTrade {
    pub event_time: i64,
    pub agg_id: u64,
    pub price: f64,
    pub qty: f64,
    pub trade_time: i64,
    pub is_buyer_maker: bool,
}

impl AggTrade {
    /// +1 aggressive buy, -1 aggressive sell. 0 is reserved for synthetic
    /// ticks that carry no aggressor side.
    pub fn direction(&self) -> i8 {
        if self.is_buyer_maker { -1 } else { 1 }
    }

    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }

    pub fn signed_qty(&self) -> f64 {
        self.qty * f64::from(self.direction())
    }
}

#[derive(Deserialize)]
struct AggTradeWire<'a> {
    #[serde(rename = "e")]
    event_type: &'a str,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: &'a str,
    #[serde(rename = "q")]
    qty: &'a str,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    is_buyer_maker: bool,
}

/// Decodes an aggTrade frame directly from the payload slice. Scalar fields
/// borrow from the buffer; only the decimal strings are parsed out.
pub fn parse_agg_trade(payload: &[u8]) -> Result<AggTrade, AdapterError> {
    let wire: AggTradeWire =
        sonic_rs::from_slice(payload).map_err(|e| AdapterError::ParseError(e.to_string()))?;

    if wire.event_type != "aggTrade" {
        return Err(AdapterError::ParseError(format!(
            "unexpected event type '{}' on aggTrade stream",
            wire.event_type
        )));
    }

    let price = wire
        .price
        .parse::<f64>()
        .map_err(|e| AdapterError::ParseError(e.to_string()))?;
    let qty = wire
        .qty
        .parse::<f64>()
        .map_err(|e| AdapterError::ParseError(e.to_string()))?;

    if !price.is_finite() || !qty.is_finite() || qty < 0.0 {
        return Err(AdapterError::ParseError(
            "price/qty must be finite and qty non-negative".to_string(),
        ));
    }

    Ok(AggTrade {
        event_time: wire.event_time,
        agg_id: wire.agg_id,
        price,
        qty,
        trade_time: wire.trade_time,
        is_buyer_maker: wire.is_buyer_maker,
    })
}

/// OHLCV candle keyed by bucket open time (ms). Serialized with the short
/// field names the frontend consumes.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Candle {
    pub fn from_trade(bucket_open_ms: i64, price: f64, qty: f64) -> Self {
        Self {
            time: bucket_open_ms,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: qty,
        }
    }

    pub fn apply_trade(&mut self, price: f64, qty: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += qty;
    }
}

/// Signed-flow sibling of [`Candle`]: every trade contributes `+qty` when the
/// aggressor bought and `-qty` when it sold. Open is the first signed delta
/// of the bucket, close the latest running sum, high/low the running-sum
/// extremes, volume the unsigned traded quantity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeltaCandle {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    #[serde(rename = "v")]
    pub volume: f64,
}

impl DeltaCandle {
    pub fn from_signed_qty(bucket_open_ms: i64, signed_qty: f64, qty: f64) -> Self {
        Self {
            time: bucket_open_ms,
            open: signed_qty,
            high: signed_qty,
            low: signed_qty,
            close: signed_qty,
            volume: qty.max(0.0),
        }
    }

    pub fn apply_signed_qty(&mut self, signed_qty: f64, qty: f64) {
        self.close += signed_qty;
        self.high = self.high.max(self.close);
        self.low = self.low.min(self.close);
        self.volume += qty.max(0.0);
    }

    /// Bucket reconstructed from aggregate buy/sell volume, where the
    /// intra-bucket path is unknown. Opens at zero and jumps to the net.
    pub fn from_net_delta(bucket_open_ms: i64, net_delta: f64, volume: f64) -> Self {
        Self {
            time: bucket_open_ms,
            open: 0.0,
            high: net_delta.max(0.0),
            low: net_delta.min(0.0),
            close: net_delta,
            volume: volume.max(0.0),
        }
    }
}

/// Canonical symbol form: trimmed, upper-case, ASCII alphanumeric.
pub fn normalize_symbol(symbol: &str) -> Result<String, String> {
    let normalized = symbol.trim().to_ascii_uppercase();
    if normalized.is_empty() || !normalized.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err("symbol must be non-empty alphanumeric ASCII".to_string());
    }
    Ok(normalized)
}

pub(crate) fn de_string_to_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_bucket_seconds_cover_all_widths() {
        assert_eq!(Timeframe::M1.bucket_seconds(), 60);
        assert_eq!(Timeframe::M5.bucket_seconds(), 300);
        assert_eq!(Timeframe::H1.bucket_seconds(), 3_600);
        assert_eq!(Timeframe::H4.bucket_seconds(), 14_400);
        assert_eq!(Timeframe::D1.bucket_seconds(), 86_400);
        assert_eq!(Timeframe::W1.bucket_seconds(), 604_800);
        assert_eq!(Timeframe::Mn1.bucket_seconds(), 2_592_000);
    }

    #[test]
    fn bucket_open_is_aligned() {
        for tf in Timeframe::ALL {
            let open = tf.bucket_open_ms(1_736_954_321_987);
            assert_eq!(open % tf.to_milliseconds(), 0);
        }
        assert_eq!(Timeframe::M1.bucket_open_ms(60_100), 60_000);
        assert_eq!(Timeframe::M1.bucket_open_ms(60_000), 60_000);
        assert_eq!(Timeframe::M1.bucket_open_ms(119_999), 60_000);
    }

    #[test]
    fn timeframe_round_trips_through_str() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>(), Ok(tf));
        }
        assert!("17m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn parses_agg_trade_payload() {
        let payload = br#"{"e":"aggTrade","E":123456790,"s":"BTCUSDT","a":55,"p":"1000.5","q":"0.25","T":123456789,"m":false}"#;
        let trade = parse_agg_trade(payload).expect("payload should parse");

        assert_eq!(trade.agg_id, 55);
        assert_eq!(trade.price, 1000.5);
        assert_eq!(trade.qty, 0.25);
        assert_eq!(trade.direction(), 1);
        assert_eq!(trade.notional(), 250.125);
    }

    #[test]
    fn rejects_malformed_agg_trade_payload() {
        let broken_price = br#"{"e":"aggTrade","E":1,"s":"BTCUSDT","a":55,"p":"oops","q":"0.25","T":1,"m":false}"#;
        assert!(parse_agg_trade(broken_price).is_err());

        let wrong_event =
            br#"{"e":"trade","E":1,"s":"BTCUSDT","a":55,"p":"10","q":"0.25","T":1,"m":false}"#;
        assert!(parse_agg_trade(wrong_event).is_err());

        assert!(parse_agg_trade(b"not json").is_err());
    }

    #[test]
    fn direction_follows_buyer_maker_flag() {
        let mut trade = AggTrade {
            event_time: 0,
            agg_id: 1,
            price: 10.0,
            qty: 2.0,
            trade_time: 0,
            is_buyer_maker: true,
        };
        assert_eq!(trade.direction(), -1);
        assert_eq!(trade.signed_qty(), -2.0);

        trade.is_buyer_maker = false;
        assert_eq!(trade.direction(), 1);
        assert_eq!(trade.signed_qty(), 2.0);
    }

    #[test]
    fn candle_merge_keeps_ohlc_invariant() {
        let mut candle = Candle::from_trade(60_000, 100.0, 2.0);
        candle.apply_trade(101.0, 1.0);
        candle.apply_trade(100.5, 1.0);

        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 101.0);
        assert_eq!(candle.low, 100.0);
        assert_eq!(candle.close, 100.5);
        assert!((candle.volume - 4.0).abs() < 1e-9);
        assert!(candle.low <= candle.open.min(candle.close));
        assert!(candle.high >= candle.open.max(candle.close));
    }

    #[test]
    fn delta_candle_tracks_running_sum_extremes() {
        // +2, -1, +1 => running sums 2, 1, 2
        let mut delta = DeltaCandle::from_signed_qty(60_000, 2.0, 2.0);
        delta.apply_signed_qty(-1.0, 1.0);
        delta.apply_signed_qty(1.0, 1.0);

        assert_eq!(delta.open, 2.0);
        assert_eq!(delta.high, 2.0);
        assert_eq!(delta.low, 1.0);
        assert_eq!(delta.close, 2.0);
        assert!((delta.volume - 4.0).abs() < 1e-9);
        assert!(delta.low <= delta.close && delta.close <= delta.high);
        assert!((delta.close - delta.open).abs() <= delta.volume);
    }

    #[test]
    fn net_delta_bucket_opens_at_zero() {
        let positive = DeltaCandle::from_net_delta(0, 3.5, 10.0);
        assert_eq!(positive.open, 0.0);
        assert_eq!(positive.high, 3.5);
        assert_eq!(positive.low, 0.0);

        let negative = DeltaCandle::from_net_delta(0, -3.5, 10.0);
        assert_eq!(negative.high, 0.0);
        assert_eq!(negative.low, -3.5);
    }

    #[test]
    fn symbol_normalization_uppercases_and_validates() {
        assert_eq!(normalize_symbol(" btcusdt "), Ok("BTCUSDT".to_string()));
        assert!(normalize_symbol("").is_err());
        assert!(normalize_symbol("BTC/USDT").is_err());
    }

    #[test]
    fn candle_serializes_with_short_keys() {
        let candle = Candle::from_trade(60_000, 100.0, 1.0);
        let json = serde_json::to_value(&candle).expect("candle serializes");
        assert_eq!(json["t"], 60_000);
        assert_eq!(json["o"], 100.0);
        assert_eq!(json["v"], 1.0);
    }
}
