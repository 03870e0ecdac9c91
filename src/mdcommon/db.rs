use crate::mdcommon::config::Config;
use crate::mdcommon::error::Result;
use crate::mdcommon::models::{Candle, OrderBookLevel, OrderBookSnapshot};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

/// 时序存储适配器
///
/// 连接池由所有采集循环和查询层共享。所有操作在await点挂起，
/// 不跨await持有任何锁。
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池并确保表结构存在
    ///
    /// 池参数沿用生产设置：min=2 / max=10，单操作30秒超时，
    /// 事务内空闲300秒超时。
    pub async fn connect(config: &Config) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .database(&config.db_name)
            .username(&config.db_user)
            .password(&config.db_password)
            .options([
                ("statement_timeout", "30000"),
                ("idle_in_transaction_session_timeout", "300000"),
            ]);

        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        info!(target: "db", "时序存储已连接: {}:{}/{}", config.db_host, config.db_port, config.db_name);
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                open_time TIMESTAMPTZ NOT NULL,
                close_time TIMESTAMPTZ NOT NULL,
                open_price NUMERIC(30, 8) NOT NULL,
                high_price NUMERIC(30, 8) NOT NULL,
                low_price NUMERIC(30, 8) NOT NULL,
                close_price NUMERIC(30, 8) NOT NULL,
                volume NUMERIC(30, 8) NOT NULL,
                quote_volume NUMERIC(30, 8) NOT NULL,
                trades BIGINT NOT NULL,
                taker_buy_volume NUMERIC(30, 8) NOT NULL,
                taker_buy_quote_volume NUMERIC(30, 8) NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"CREATE INDEX IF NOT EXISTS idx_candles_symbol_open_time
              ON candles (symbol, open_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS orderbook_data (
                symbol TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                last_update_id BIGINT NOT NULL,
                bids JSONB NOT NULL,
                asks JSONB NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS collector_state (
                symbol TEXT PRIMARY KEY,
                last_timestamp BIGINT NOT NULL,
                is_realtime BOOLEAN NOT NULL DEFAULT FALSE,
                last_updated TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 批量写入K线，主键冲突的行静默跳过
    ///
    /// 整批在一个事务内提交，返回实际新插入的行数。
    pub async fn insert_candles(&self, candles: &[Candle]) -> Result<u64> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for candle in candles {
            let result = sqlx::query(
                r"
                INSERT INTO candles (symbol, timestamp, open_time, close_time,
                    open_price, high_price, low_price, close_price,
                    volume, quote_volume, trades, taker_buy_volume, taker_buy_quote_volume)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (symbol, timestamp) DO NOTHING
                ",
            )
            .bind(&candle.symbol)
            .bind(candle.timestamp)
            .bind(candle.open_time)
            .bind(candle.close_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .bind(candle.quote_volume)
            .bind(candle.trades)
            .bind(candle.taker_buy_volume)
            .bind(candle.taker_buy_quote_volume)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        debug!(target: "db", "{}: 写入 {}/{} 条K线", candles[0].symbol, inserted, candles.len());
        Ok(inserted)
    }

    /// 写入一条深度快照，(symbol, timestamp) 冲突静默跳过
    pub async fn insert_orderbook(&self, snapshot: &OrderBookSnapshot) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO orderbook_data (symbol, timestamp, last_update_id, bids, asks)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (symbol, timestamp) DO NOTHING
            ",
        )
        .bind(&snapshot.symbol)
        .bind(snapshot.timestamp)
        .bind(snapshot.last_update_id)
        .bind(Json(&snapshot.bids))
        .bind(Json(&snapshot.asks))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 采集状态检查点，每交易对一行
    pub async fn upsert_state(&self, symbol: &str, last_timestamp: i64, is_realtime: bool) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO collector_state (symbol, last_timestamp, is_realtime, last_updated)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (symbol) DO UPDATE SET
                last_timestamp = EXCLUDED.last_timestamp,
                is_realtime = EXCLUDED.is_realtime,
                last_updated = NOW()
            ",
        )
        .bind(symbol)
        .bind(last_timestamp)
        .bind(is_realtime)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_last_timestamp(&self, symbol: &str) -> Result<Option<i64>> {
        let result = sqlx::query_scalar(
            "SELECT last_timestamp FROM collector_state WHERE symbol = $1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    /// 区间查询K线
    ///
    /// timeframe_minutes > 1 时在存储端按时间桶聚合：
    /// 桶起点 = floor(open_time / 周期) × 周期，open取桶内首根，
    /// close取末根，high/low取极值，成交量与笔数求和。
    /// 无 start 时取最近 limit 个桶；返回结果总是按桶起点升序。
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe_minutes: i64,
        start: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Candle>> {
        let mut rows = if timeframe_minutes <= 1 {
            self.fetch_minute_candles(symbol, start, limit).await?
        } else {
            self.fetch_bucketed_candles(symbol, timeframe_minutes, start, limit).await?
        };

        // 无起始时间时按倒序取最近N个，这里统一翻回升序
        if start.is_none() {
            rows.reverse();
        }

        Ok(rows)
    }

    async fn fetch_minute_candles(
        &self,
        symbol: &str,
        start: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Candle>> {
        const COLUMNS: &str = "timestamp, open_time, close_time, open_price, high_price, \
            low_price, close_price, volume, quote_volume, trades, taker_buy_volume, taker_buy_quote_volume";

        let rows = match start {
            Some(start) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM candles WHERE symbol = $1 AND open_time >= $2 \
                     ORDER BY timestamp ASC LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(symbol)
                    .bind(start)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM candles WHERE symbol = $1 \
                     ORDER BY timestamp DESC LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(symbol)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(|row| row_to_candle(symbol, row)).collect()
    }

    async fn fetch_bucketed_candles(
        &self,
        symbol: &str,
        minutes: i64,
        start: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Candle>> {
        // 周期分钟数来自固定目录，不是用户输入，可以直接拼进SQL
        let interval = format!("{} minutes", minutes);
        let order = if start.is_some() { "ASC" } else { "DESC" };

        let mut sql = format!(
            r"
            SELECT
                (EXTRACT(epoch FROM time_bucket('{interval}', open_time)) * 1000)::BIGINT AS timestamp,
                time_bucket('{interval}', open_time) AS open_time,
                time_bucket('{interval}', open_time) + interval '{interval}' - interval '1 second' AS close_time,
                first(open_price, open_time) AS open_price,
                max(high_price) AS high_price,
                min(low_price) AS low_price,
                last(close_price, open_time) AS close_price,
                sum(volume) AS volume,
                sum(quote_volume) AS quote_volume,
                sum(trades)::BIGINT AS trades,
                sum(taker_buy_volume) AS taker_buy_volume,
                sum(taker_buy_quote_volume) AS taker_buy_quote_volume
            FROM candles
            WHERE symbol = $1
            "
        );

        if start.is_some() {
            sql.push_str(" AND open_time >= $2");
        }
        sql.push_str(&format!(
            " GROUP BY time_bucket('{interval}', open_time) \
             ORDER BY time_bucket('{interval}', open_time) {order} LIMIT {limit}"
        ));

        let query = sqlx::query(&sql).bind(symbol);
        let rows = match start {
            Some(start) => query.bind(start).fetch_all(&self.pool).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        rows.iter().map(|row| row_to_candle(symbol, row)).collect()
    }

    /// 最新一条深度快照，按请求档位截断
    pub async fn get_orderbook_latest(
        &self,
        symbol: &str,
        levels: usize,
    ) -> Result<Option<OrderBookSnapshot>> {
        let row = sqlx::query(
            r"
            SELECT symbol, timestamp, last_update_id, bids, asks
            FROM orderbook_data
            WHERE symbol = $1
            ORDER BY timestamp DESC
            LIMIT 1
            ",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let bids: Json<Vec<OrderBookLevel>> = row.try_get("bids")?;
        let asks: Json<Vec<OrderBookLevel>> = row.try_get("asks")?;

        let snapshot = OrderBookSnapshot {
            symbol: row.try_get("symbol")?,
            timestamp: row.try_get("timestamp")?,
            last_update_id: row.try_get("last_update_id")?,
            bids: bids.0,
            asks: asks.0,
        };

        Ok(Some(snapshot.truncated(levels)))
    }

    /// K线表中出现过的所有交易对，升序去重
    pub async fn get_symbols(&self) -> Result<Vec<String>> {
        let symbols = sqlx::query_scalar("SELECT DISTINCT symbol FROM candles ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;

        Ok(symbols)
    }

    /// 存储健康探测
    pub async fn health(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

fn row_to_candle(symbol: &str, row: &PgRow) -> Result<Candle> {
    Ok(Candle {
        symbol: symbol.to_string(),
        timestamp: row.try_get("timestamp")?,
        open_time: row.try_get("open_time")?,
        close_time: row.try_get("close_time")?,
        open: row.try_get::<Decimal, _>("open_price")?,
        high: row.try_get::<Decimal, _>("high_price")?,
        low: row.try_get::<Decimal, _>("low_price")?,
        close: row.try_get::<Decimal, _>("close_price")?,
        volume: row.try_get("volume")?,
        quote_volume: row.try_get("quote_volume")?,
        trades: row.try_get("trades")?,
        taker_buy_volume: row.try_get("taker_buy_volume")?,
        taker_buy_quote_volume: row.try_get("taker_buy_quote_volume")?,
    })
}
