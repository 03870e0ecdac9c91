use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

use crate::mdcommon::config::{timeframe_labels, timeframe_minutes, ORDERBOOK_SUPPORTED_LEVELS};
use crate::mdcommon::models::Candle;
use crate::mdserver::hub::HubCommand;
use crate::mdserver::web::AppState;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_request(reason: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": reason.into() })))
}

fn not_found(reason: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({ "error": reason })))
}

fn internal_error() -> ApiError {
    // Never leak internals to clients
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Internal server error" })))
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let db_ok = state.db.health().await;
    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "timestamp": Utc::now().to_rfc3339(),
        "database": if db_ok { "healthy" } else { "unhealthy" },
    }))
}

/// GET /symbols
pub async fn symbols_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    match state.db.get_symbols().await {
        Ok(symbols) => Ok(Json(json!({ "symbols": symbols }))),
        Err(e) => {
            error!(target: "web", "Error fetching symbols: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Database error" }))))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    symbol: Option<String>,
    timeframe: Option<String>,
    limit: Option<i64>,
    start_date: Option<String>,
}

/// Candle row in API responses, decimals rendered as plain strings
#[derive(Debug, Serialize)]
pub struct CandleRow {
    pub timestamp: i64,
    pub open_time: String,
    pub close_time: String,
    pub open_price: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub close_price: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl From<&Candle> for CandleRow {
    fn from(candle: &Candle) -> Self {
        Self {
            timestamp: candle.timestamp,
            open_time: candle.open_time.to_rfc3339(),
            close_time: candle.close_time.to_rfc3339(),
            open_price: candle.open,
            high_price: candle.high,
            low_price: candle.low,
            close_price: candle.close,
            volume: candle.volume,
            quote_volume: candle.quote_volume,
            trades: candle.trades,
            taker_buy_volume: candle.taker_buy_volume,
            taker_buy_quote_volume: candle.taker_buy_quote_volume,
        }
    }
}

/// GET /candles?symbol&timeframe&limit&start_date
pub async fn candles_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CandlesQuery>,
) -> ApiResult<Json<Vec<CandleRow>>> {
    let symbol = params
        .symbol
        .ok_or_else(|| bad_request("symbol parameter is required"))?
        .to_uppercase();

    let timeframe = params.timeframe.unwrap_or_else(|| "1".to_string());
    let minutes = timeframe_minutes(&timeframe).ok_or_else(|| {
        bad_request(format!("Invalid timeframe. Supported: {:?}", timeframe_labels()))
    })?;

    let limit = params.limit.unwrap_or(500);
    if !(1..=5000).contains(&limit) {
        return Err(bad_request("limit must be between 1 and 5000"));
    }

    let start_date = match params.start_date {
        Some(raw) => Some(parse_start_date(&raw).ok_or_else(|| bad_request("Invalid start_date format"))?),
        None => None,
    };

    let candles = state
        .db
        .get_candles(&symbol, minutes, start_date, limit)
        .await
        .map_err(|e| {
            error!(target: "web", "Error in get_candles: {}", e);
            internal_error()
        })?;

    Ok(Json(candles.iter().map(CandleRow::from).collect()))
}

/// Accepts RFC3339 instants and plain YYYY-MM-DD dates
fn parse_start_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc))
}

#[derive(Debug, Deserialize)]
pub struct OrderBookQuery {
    symbol: Option<String>,
    levels: Option<usize>,
}

/// GET /orderbook?symbol&levels
pub async fn orderbook_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OrderBookQuery>,
) -> ApiResult<Json<Value>> {
    let symbol = params
        .symbol
        .ok_or_else(|| bad_request("symbol parameter is required"))?
        .to_uppercase();

    let levels = params.levels.unwrap_or(crate::mdcommon::ORDERBOOK_DEFAULT_LEVELS);
    if !ORDERBOOK_SUPPORTED_LEVELS.contains(&levels) {
        return Err(bad_request(format!(
            "Invalid levels. Supported: {:?}",
            ORDERBOOK_SUPPORTED_LEVELS
        )));
    }

    let snapshot = state
        .db
        .get_orderbook_latest(&symbol, levels)
        .await
        .map_err(|e| {
            error!(target: "web", "Error in get_orderbook: {}", e);
            internal_error()
        })?;

    match snapshot {
        Some(snapshot) => Ok(Json(serde_json::to_value(snapshot).map_err(|e| {
            error!(target: "web", "Error serializing orderbook: {}", e);
            internal_error()
        })?)),
        None => Err(not_found("No orderbook data available for this symbol")),
    }
}

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    symbol: Option<String>,
    timeframe: Option<String>,
}

/// GET /price?symbol&timeframe
///
/// Prefers the aggregator's in-progress candle; otherwise derives the
/// quote from the two most recent closed candles of that timeframe.
pub async fn price_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PriceQuery>,
) -> ApiResult<Json<Value>> {
    let symbol = params
        .symbol
        .ok_or_else(|| bad_request("symbol parameter is required"))?
        .to_uppercase();

    let timeframe = params.timeframe.unwrap_or_else(|| "1".to_string());
    let minutes = timeframe_minutes(&timeframe).ok_or_else(|| {
        bad_request(format!("Invalid timeframe. Supported: {:?}", timeframe_labels()))
    })?;

    let current_partial = query_current_candle(&state, &symbol, &timeframe).await;

    let (current_price, previous_price, timestamp, volume) = if let Some(current) = current_partial {
        let closed = state
            .db
            .get_candles(&symbol, minutes, None, 1)
            .await
            .map_err(|e| {
                error!(target: "web", "Error in get_price: {}", e);
                internal_error()
            })?;

        let previous = closed.last().map(|c| c.close).unwrap_or(current.close);
        (current.close, previous, current.timestamp, current.volume)
    } else {
        let closed = state
            .db
            .get_candles(&symbol, minutes, None, 2)
            .await
            .map_err(|e| {
                error!(target: "web", "Error in get_price: {}", e);
                internal_error()
            })?;

        let Some(current) = closed.last() else {
            return Err(not_found("No data available for this symbol"));
        };
        // 只有一根K线时，previous 与 current 相同，涨跌为零
        let previous = if closed.len() >= 2 { &closed[closed.len() - 2] } else { current };
        (current.close, previous.close, current.timestamp, current.volume)
    };

    let (change_absolute, change_percent, trend) = price_stats(current_price, previous_price);

    Ok(Json(json!({
        "symbol": symbol,
        "timeframe": timeframe,
        "current_price": current_price,
        "previous_price": previous_price,
        "change_absolute": change_absolute,
        "change_percent": change_percent,
        "trend": trend,
        "timestamp": timestamp,
        "volume": volume,
    })))
}

async fn query_current_candle(
    state: &AppState,
    symbol: &str,
    timeframe: &str,
) -> Option<crate::mdserver::aggregator::AggregatedCandle> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .hub
        .send(HubCommand::CurrentCandle {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            reply: reply_tx,
        })
        .await
        .ok()?;
    reply_rx.await.ok().flatten()
}

/// Absolute change, percent change (2 decimals) and trend direction
pub fn price_stats(current: Decimal, previous: Decimal) -> (Decimal, Decimal, &'static str) {
    let change = current - previous;
    let percent = if previous.is_zero() {
        Decimal::ZERO
    } else {
        (change / previous * Decimal::from(100)).round_dp(2)
    };

    let trend = if change > Decimal::ZERO {
        "up"
    } else if change < Decimal::ZERO {
        "down"
    } else {
        "neutral"
    };

    (change, percent, trend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_stats_uptrend() {
        // 1H周期：进行中105654.78，上一根收盘105200.45
        let (change, percent, trend) = price_stats(dec!(105654.78), dec!(105200.45));
        assert_eq!(change, dec!(454.33));
        assert_eq!(percent, dec!(0.43));
        assert_eq!(trend, "up");
    }

    #[test]
    fn test_price_stats_downtrend_and_flat() {
        let (change, _, trend) = price_stats(dec!(99), dec!(100));
        assert_eq!(change, dec!(-1));
        assert_eq!(trend, "down");

        let (change, percent, trend) = price_stats(dec!(100), dec!(100));
        assert_eq!(change, Decimal::ZERO);
        assert_eq!(percent, Decimal::ZERO);
        assert_eq!(trend, "neutral");
    }

    #[test]
    fn test_price_stats_zero_previous() {
        let (_, percent, trend) = price_stats(dec!(5), Decimal::ZERO);
        assert_eq!(percent, Decimal::ZERO);
        assert_eq!(trend, "up");
    }

    #[test]
    fn test_parse_start_date() {
        assert!(parse_start_date("2025-01-01T00:00:00Z").is_some());
        assert!(parse_start_date("2025-01-01T00:00:00+03:00").is_some());
        assert!(parse_start_date("2025-01-01").is_some());
        assert!(parse_start_date("January 1st").is_none());
    }
}
