use crate::event::Tick;

use exchange::{AggTrade, Candle, DeltaCandle, Timeframe};

/// The rendezvous between Producer and Consumer: latest candle, delta candle
/// and tick, plus the dirty flag the Consumer conflates on.
///
/// Guarded by a fast mutex; every operation in here is arithmetic and field
/// copies only — no I/O, no allocation beyond the snapshot clones.
#[derive(Debug, Default)]
pub struct ConflatedState {
    current_candle: Option<Candle>,
    current_delta_candle: Option<DeltaCandle>,
    last_tick: Option<Tick>,
    dirty: bool,
    candle_started_at_ms: Option<i64>,
}

/// What the Consumer takes on each tick. `was_dirty == false` means nothing
/// changed since the previous emit and the frame must be skipped.
#[derive(Debug, Clone)]
pub struct EmitSnapshot {
    pub candle: Option<Candle>,
    pub delta_candle: Option<DeltaCandle>,
    pub tick: Option<Tick>,
    pub was_dirty: bool,
}

impl ConflatedState {
    /// Producer-only. The caller has already validated sequence continuity
    /// and the notional filter.
    pub fn apply_trade(&mut self, trade: &AggTrade, timeframe: Timeframe) {
        let bucket_open = timeframe.bucket_open_ms(trade.trade_time);

        match self.current_candle.as_mut() {
            // Straggler for a bucket that already rolled over; never rewind.
            Some(current) if bucket_open < current.time => {}
            Some(current) if bucket_open == current.time => {
                current.apply_trade(trade.price, trade.qty);
            }
            _ => {
                self.current_candle = Some(Candle::from_trade(bucket_open, trade.price, trade.qty));
                self.candle_started_at_ms = Some(bucket_open);
            }
        }

        let signed_qty = trade.signed_qty();
        match self.current_delta_candle.as_mut() {
            Some(current) if bucket_open < current.time => {}
            Some(current) if bucket_open == current.time => {
                current.apply_signed_qty(signed_qty, trade.qty);
            }
            _ => {
                self.current_delta_candle = Some(DeltaCandle::from_signed_qty(
                    bucket_open,
                    signed_qty,
                    trade.qty,
                ));
            }
        }

        self.last_tick = Some(Tick {
            time: trade.trade_time,
            price: trade.price,
            qty: trade.qty,
            direction: trade.direction(),
        });
        self.dirty = true;
    }

    /// Consumer-only. Returns the latest state by value and clears `dirty`.
    pub fn snapshot_for_emit(&mut self) -> EmitSnapshot {
        let was_dirty = self.dirty;
        self.dirty = false;

        EmitSnapshot {
            candle: self.current_candle.clone(),
            delta_candle: self.current_delta_candle.clone(),
            tick: self.last_tick.clone(),
            was_dirty,
        }
    }

    /// Installs the newest bootstrap bucket as the live one, so the first
    /// trades of a partially-filled bucket extend it instead of restarting
    /// at the trade price. Does not dirty the state; bootstrap data reaches
    /// the shell through its own events.
    pub fn seed_history(&mut self, candles: &[Candle], delta_candles: &[DeltaCandle]) {
        if let Some(last) = candles.last() {
            let replace = self
                .current_candle
                .as_ref()
                .is_none_or(|current| last.time >= current.time);
            if replace {
                self.current_candle = Some(last.clone());
                self.candle_started_at_ms = Some(last.time);
            }
        }

        if let Some(last) = delta_candles.last() {
            let replace = self
                .current_delta_candle
                .as_ref()
                .is_none_or(|current| last.time >= current.time);
            if replace {
                self.current_delta_candle = Some(last.clone());
            }
        }
    }

    pub fn candle_started_at_ms(&self) -> Option<i64> {
        self.candle_started_at_ms
    }
}
