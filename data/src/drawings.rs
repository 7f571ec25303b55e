use crate::{MarketStore, StoreError, now_unix_ms};

use exchange::{MarketKind, Timeframe, normalize_symbol};

use serde::{Deserialize, Serialize};
use sqlx::Row;

pub const MAX_LABEL_LEN: usize = 120;

const SUPPORTED_DRAWING_TYPES: [&str; 5] = [
    "trendLine",
    "horizontalLine",
    "ruler",
    "fibRetracement",
    "fibExtension",
];

/// A chart drawing scoped to (marketKind, symbol, timeframe). Geometry stays
/// opaque to the store as `payload_json`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Drawing {
    pub id: String,
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub drawing_type: String,
    pub color: String,
    pub label: Option<String>,
    pub payload_json: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawingScope {
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl DrawingScope {
    fn normalize(self) -> Result<Self, StoreError> {
        Ok(Self {
            market_kind: self.market_kind,
            symbol: normalize_symbol(&self.symbol).map_err(StoreError::InvalidArgument)?,
            timeframe: self.timeframe,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertDrawingArgs {
    pub id: String,
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub drawing_type: String,
    pub color: String,
    pub label: Option<String>,
    pub payload_json: String,
    pub created_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDrawingArgs {
    pub id: String,
    pub market_kind: MarketKind,
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDrawingResult {
    pub deleted: bool,
}

fn normalize_color(color: &str) -> Result<String, StoreError> {
    let normalized = color.trim().to_ascii_uppercase();
    let valid = normalized.len() == 7
        && normalized.starts_with('#')
        && normalized.chars().skip(1).all(|ch| ch.is_ascii_hexdigit());

    if !valid {
        return Err(StoreError::InvalidArgument(
            "drawing color must be #RRGGBB".to_string(),
        ));
    }
    Ok(normalized)
}

fn normalize_label(label: Option<String>) -> Result<Option<String>, StoreError> {
    let Some(label) = label else {
        return Ok(None);
    };

    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_LABEL_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "drawing label exceeds max length ({MAX_LABEL_LEN})"
        )));
    }

    Ok(Some(trimmed.to_string()))
}

impl UpsertDrawingArgs {
    fn normalize(self) -> Result<Self, StoreError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "drawing id must be non-empty".to_string(),
            ));
        }

        let drawing_type = self.drawing_type.trim().to_string();
        if !SUPPORTED_DRAWING_TYPES.contains(&drawing_type.as_str()) {
            return Err(StoreError::InvalidArgument(format!(
                "unsupported drawing type '{drawing_type}'"
            )));
        }

        let payload_json = self.payload_json.trim().to_string();
        if payload_json.is_empty() {
            return Err(StoreError::InvalidArgument(
                "payloadJson must be non-empty".to_string(),
            ));
        }

        Ok(Self {
            id,
            market_kind: self.market_kind,
            symbol: normalize_symbol(&self.symbol).map_err(StoreError::InvalidArgument)?,
            timeframe: self.timeframe,
            drawing_type,
            color: normalize_color(&self.color)?,
            label: normalize_label(self.label)?,
            payload_json,
            created_at_ms: self.created_at_ms,
        })
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Drawing, StoreError> {
    let market_kind_raw: String = row.try_get("market_kind")?;
    let timeframe_raw: String = row.try_get("timeframe")?;

    Ok(Drawing {
        id: row.try_get("id")?,
        market_kind: market_kind_raw
            .parse::<MarketKind>()
            .map_err(StoreError::InvalidArgument)?,
        symbol: row.try_get("symbol")?,
        timeframe: timeframe_raw
            .parse::<Timeframe>()
            .map_err(StoreError::InvalidArgument)?,
        drawing_type: row.try_get("drawing_type")?,
        color: row.try_get("color")?,
        label: row.try_get("label")?,
        payload_json: row.try_get("payload_json")?,
        created_at_ms: row.try_get("created_at_ms")?,
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

impl MarketStore {
    pub async fn list_drawings(&self, scope: DrawingScope) -> Result<Vec<Drawing>, StoreError> {
        let scope = scope.normalize()?;

        let rows = sqlx::query(
            "SELECT id, market_kind, symbol, timeframe, drawing_type, color, label, payload_json, created_at_ms, updated_at_ms \
             FROM market_drawings \
             WHERE market_kind = ? AND symbol = ? AND timeframe = ? \
             ORDER BY updated_at_ms ASC, id ASC",
        )
        .bind(scope.market_kind.as_str())
        .bind(&scope.symbol)
        .bind(scope.timeframe.as_str())
        .fetch_all(self.pool())
        .await?;

        let mut drawings = Vec::with_capacity(rows.len());
        for row in rows {
            drawings.push(map_row(&row)?);
        }
        Ok(drawings)
    }

    pub async fn upsert_drawing(&self, args: UpsertDrawingArgs) -> Result<Drawing, StoreError> {
        let normalized = args.normalize()?;
        let now_ms = now_unix_ms();
        let created_at_ms = normalized.created_at_ms.unwrap_or(now_ms);
        let drawing_id = normalized.id.clone();

        sqlx::query(
            "INSERT INTO market_drawings (id, market_kind, symbol, timeframe, drawing_type, color, label, payload_json, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               market_kind = excluded.market_kind, \
               symbol = excluded.symbol, \
               timeframe = excluded.timeframe, \
               drawing_type = excluded.drawing_type, \
               color = excluded.color, \
               label = excluded.label, \
               payload_json = excluded.payload_json, \
               updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&drawing_id)
        .bind(normalized.market_kind.as_str())
        .bind(&normalized.symbol)
        .bind(normalized.timeframe.as_str())
        .bind(&normalized.drawing_type)
        .bind(&normalized.color)
        .bind(&normalized.label)
        .bind(&normalized.payload_json)
        .bind(created_at_ms)
        .bind(now_ms)
        .execute(self.pool())
        .await?;

        let row = sqlx::query(
            "SELECT id, market_kind, symbol, timeframe, drawing_type, color, label, payload_json, created_at_ms, updated_at_ms \
             FROM market_drawings WHERE id = ?",
        )
        .bind(&drawing_id)
        .fetch_one(self.pool())
        .await?;

        map_row(&row)
    }

    pub async fn delete_drawing(
        &self,
        args: DeleteDrawingArgs,
    ) -> Result<DeleteDrawingResult, StoreError> {
        let id = args.id.trim().to_string();
        if id.is_empty() {
            return Err(StoreError::InvalidArgument(
                "drawing id must be non-empty".to_string(),
            ));
        }
        let symbol = normalize_symbol(&args.symbol).map_err(StoreError::InvalidArgument)?;

        let result = sqlx::query(
            "DELETE FROM market_drawings WHERE id = ? AND market_kind = ? AND symbol = ? AND timeframe = ?",
        )
        .bind(id)
        .bind(args.market_kind.as_str())
        .bind(symbol)
        .bind(args.timeframe.as_str())
        .execute(self.pool())
        .await?;

        Ok(DeleteDrawingResult {
            deleted: result.rows_affected() > 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> DrawingScope {
        DrawingScope {
            market_kind: MarketKind::Spot,
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
        }
    }

    fn upsert_args(id: &str) -> UpsertDrawingArgs {
        UpsertDrawingArgs {
            id: id.to_string(),
            market_kind: MarketKind::Spot,
            symbol: "btcusdt".to_string(),
            timeframe: Timeframe::M1,
            drawing_type: "trendLine".to_string(),
            color: "#aabbcc".to_string(),
            label: Some("  Support  ".to_string()),
            payload_json: r#"{"points":[[1,2],[3,4]]}"#.to_string(),
            created_at_ms: None,
        }
    }

    #[tokio::test]
    async fn upsert_normalizes_and_round_trips() {
        let store = MarketStore::open_in_memory().await.expect("store opens");

        let drawing = store
            .upsert_drawing(upsert_args(" draw-1 "))
            .await
            .expect("upsert succeeds");

        assert_eq!(drawing.id, "draw-1");
        assert_eq!(drawing.symbol, "BTCUSDT");
        assert_eq!(drawing.color, "#AABBCC");
        assert_eq!(drawing.label.as_deref(), Some("Support"));
        assert!(drawing.created_at_ms > 0);

        let listed = store.list_drawings(scope()).await.expect("list works");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], drawing);
    }

    #[tokio::test]
    async fn upsert_updates_existing_row_and_keeps_created_at() {
        let store = MarketStore::open_in_memory().await.expect("store opens");

        let first = store
            .upsert_drawing(upsert_args("draw-1"))
            .await
            .expect("insert succeeds");

        let mut changed = upsert_args("draw-1");
        changed.color = "#112233".to_string();
        changed.created_at_ms = Some(first.created_at_ms);
        let second = store
            .upsert_drawing(changed)
            .await
            .expect("update succeeds");

        assert_eq!(second.created_at_ms, first.created_at_ms);
        assert_eq!(second.color, "#112233");

        let listed = store.list_drawings(scope()).await.expect("list works");
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn listing_is_scoped() {
        let store = MarketStore::open_in_memory().await.expect("store opens");
        store
            .upsert_drawing(upsert_args("draw-1"))
            .await
            .expect("insert succeeds");

        let other_scope = DrawingScope {
            timeframe: Timeframe::H1,
            ..scope()
        };
        let listed = store
            .list_drawings(other_scope)
            .await
            .expect("list works");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn delete_is_scoped_and_reports_outcome() {
        let store = MarketStore::open_in_memory().await.expect("store opens");
        store
            .upsert_drawing(upsert_args("draw-1"))
            .await
            .expect("insert succeeds");

        let miss = store
            .delete_drawing(DeleteDrawingArgs {
                id: "draw-1".to_string(),
                market_kind: MarketKind::FuturesUsdm,
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M1,
            })
            .await
            .expect("delete runs");
        assert!(!miss.deleted);

        let hit = store
            .delete_drawing(DeleteDrawingArgs {
                id: "draw-1".to_string(),
                market_kind: MarketKind::Spot,
                symbol: "BTCUSDT".to_string(),
                timeframe: Timeframe::M1,
            })
            .await
            .expect("delete runs");
        assert!(hit.deleted);

        assert!(store.list_drawings(scope()).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_input() {
        let store = MarketStore::open_in_memory().await.expect("store opens");

        let mut bad_color = upsert_args("draw-1");
        bad_color.color = "red".to_string();
        assert!(matches!(
            store.upsert_drawing(bad_color).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let mut bad_type = upsert_args("draw-2");
        bad_type.drawing_type = "freehand".to_string();
        assert!(matches!(
            store.upsert_drawing(bad_type).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let mut empty_payload = upsert_args("draw-3");
        empty_payload.payload_json = "   ".to_string();
        assert!(matches!(
            store.upsert_drawing(empty_payload).await,
            Err(StoreError::InvalidArgument(_))
        ));

        let mut long_label = upsert_args("draw-4");
        long_label.label = Some("x".repeat(MAX_LABEL_LEN + 1));
        assert!(matches!(
            store.upsert_drawing(long_label).await,
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
