use crate::{MarketStore, StoreError, now_unix_ms};

use exchange::{MarketKind, Timeframe, normalize_symbol};

use serde::{Deserialize, Serialize};
use sqlx::Row;

const DEFAULT_SYMBOL: &str = "BTCUSDT";
const DEFAULT_TIMEFRAME: Timeframe = Timeframe::M1;

/// The `market_preferences` singleton row (id = 1), seeded with defaults on
/// first read.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPreferences {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub magnet_strong: bool,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavePreferencesArgs {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub magnet_strong: bool,
}

impl SavePreferencesArgs {
    fn normalize(self) -> Result<Self, StoreError> {
        Ok(Self {
            market_kind: self.market_kind,
            symbol: normalize_symbol(&self.symbol).map_err(StoreError::InvalidArgument)?,
            timeframe: self.timeframe,
            magnet_strong: self.magnet_strong,
        })
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<MarketPreferences, StoreError> {
    let market_kind_raw: String = row.try_get("market_kind")?;
    let symbol: String = row.try_get("symbol")?;
    let timeframe_raw: String = row.try_get("timeframe")?;
    let magnet_strong: i64 = row.try_get("magnet_strong")?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms")?;

    Ok(MarketPreferences {
        market_kind: market_kind_raw
            .parse::<MarketKind>()
            .map_err(StoreError::InvalidArgument)?,
        symbol,
        timeframe: timeframe_raw
            .parse::<Timeframe>()
            .map_err(StoreError::InvalidArgument)?,
        magnet_strong: magnet_strong != 0,
        updated_at_ms,
    })
}

impl MarketStore {
    async fn seed_preferences(&self) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO market_preferences (id, market_kind, symbol, timeframe, magnet_strong, updated_at_ms) \
             VALUES (1, ?, ?, ?, 0, ?)",
        )
        .bind(MarketKind::default().as_str())
        .bind(DEFAULT_SYMBOL)
        .bind(DEFAULT_TIMEFRAME.as_str())
        .bind(now_unix_ms())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_preferences(&self) -> Result<MarketPreferences, StoreError> {
        self.seed_preferences().await?;

        let row = sqlx::query(
            "SELECT market_kind, symbol, timeframe, magnet_strong, updated_at_ms \
             FROM market_preferences WHERE id = 1",
        )
        .fetch_one(self.pool())
        .await?;

        map_row(&row)
    }

    pub async fn save_preferences(
        &self,
        args: SavePreferencesArgs,
    ) -> Result<MarketPreferences, StoreError> {
        let normalized = args.normalize()?;

        sqlx::query(
            "INSERT INTO market_preferences (id, market_kind, symbol, timeframe, magnet_strong, updated_at_ms) \
             VALUES (1, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               market_kind = excluded.market_kind, \
               symbol = excluded.symbol, \
               timeframe = excluded.timeframe, \
               magnet_strong = excluded.magnet_strong, \
               updated_at_ms = excluded.updated_at_ms",
        )
        .bind(normalized.market_kind.as_str())
        .bind(&normalized.symbol)
        .bind(normalized.timeframe.as_str())
        .bind(i64::from(normalized.magnet_strong))
        .bind(now_unix_ms())
        .execute(self.pool())
        .await?;

        self.get_preferences().await
    }
}
