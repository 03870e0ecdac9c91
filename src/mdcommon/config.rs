use crate::mdcommon::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::env;
use std::time::Duration;

/// 支持的聚合周期：标签 -> 分钟数
///
/// 标签用于REST查询参数和WebSocket握手参数，分钟数用于
/// 存储端的分桶查询和内存聚合器的周期计算。
pub const TIMEFRAMES: [(&str, i64); 13] = [
    ("1", 1),
    ("3", 3),
    ("5", 5),
    ("15", 15),
    ("30", 30),
    ("45", 45),
    ("1H", 60),
    ("2H", 120),
    ("3H", 180),
    ("4H", 240),
    ("1D", 1440),
    ("1W", 10080),
    ("1M", 43200),
];

/// 深度档位只允许这三档
pub const ORDERBOOK_SUPPORTED_LEVELS: [usize; 3] = [5, 10, 20];
pub const ORDERBOOK_DEFAULT_LEVELS: usize = 20;

/// 查找周期标签对应的分钟数
pub fn timeframe_minutes(label: &str) -> Option<i64> {
    TIMEFRAMES
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, minutes)| *minutes)
}

/// 所有周期标签，用于错误提示
pub fn timeframe_labels() -> Vec<&'static str> {
    TIMEFRAMES.iter().map(|(name, _)| *name).collect()
}

/// 服务配置，全部来自环境变量
#[derive(Debug, Clone)]
pub struct Config {
    // 时序存储
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    // 消息总线
    pub redis_host: String,
    pub redis_port: u16,

    // 对外服务绑定地址
    pub api_host: String,
    pub api_port: u16,

    // 上游行情API
    pub binance_base_url: String,

    // K线采集
    pub symbols: Vec<String>,
    pub start_date_ms: i64,
    pub interval: String,
    pub batch_size: i64,
    pub retry_delay: Duration,
    pub max_retries: usize,
    pub realtime_interval: Duration,

    // 深度采集
    pub orderbook_symbols: Vec<String>,
    pub orderbook_levels: usize,
    pub orderbook_update_interval: Duration,
    pub orderbook_retry_delay: Duration,
    pub orderbook_max_retries: usize,

    // WebSocket存活协议
    pub ws_ping_interval: Duration,
    pub ws_pong_timeout: Duration,
    pub ws_cleanup_interval: Duration,
}

impl Config {
    /// 从环境变量加载配置，解析失败即启动失败
    pub fn from_env() -> Result<Self> {
        let symbols = parse_symbol_list(&env_or("SYMBOLS", "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT,BNBUSDT"));
        if symbols.is_empty() {
            return Err(AppError::ConfigError("SYMBOLS 不能为空".to_string()));
        }

        let orderbook_symbols = parse_symbol_list(&env_or(
            "ORDERBOOK_SYMBOLS",
            "BTCUSDT,ETHUSDT,SOLUSDT,XRPUSDT,BNBUSDT",
        ));

        let orderbook_levels: usize = env_parse("ORDERBOOK_LEVELS", 20)?;
        if !ORDERBOOK_SUPPORTED_LEVELS.contains(&orderbook_levels) {
            return Err(AppError::ConfigError(format!(
                "ORDERBOOK_LEVELS 只支持 {:?}，收到 {}",
                ORDERBOOK_SUPPORTED_LEVELS, orderbook_levels
            )));
        }

        let start_date = parse_date_string(&env_or("START_DATE", "2025-01-01"))?;

        Ok(Self {
            db_host: env_or("DB_HOST", "localhost"),
            db_port: env_parse("DB_PORT", 5432)?,
            db_name: env_or("DB_NAME", "crypto_data"),
            db_user: env_or("DB_USER", "crypto_user"),
            db_password: env_or("DB_PASSWORD", "crypto_pass"),

            redis_host: env_or("REDIS_HOST", "localhost"),
            redis_port: env_parse("REDIS_PORT", 6379)?,

            api_host: env_or("API_HOST", "0.0.0.0"),
            api_port: env_parse("API_PORT", 8000)?,

            binance_base_url: env_or("BINANCE_BASE_URL", "https://api.binance.com"),

            symbols,
            start_date_ms: start_date.timestamp_millis(),
            interval: env_or("INTERVAL", "1m"),
            batch_size: env_parse("BATCH_SIZE", 1000)?,
            retry_delay: Duration::from_secs_f64(env_parse("RETRY_DELAY", 1.0)?),
            max_retries: env_parse("MAX_RETRIES", 5)?,
            realtime_interval: Duration::from_secs_f64(env_parse("REALTIME_INTERVAL", 0.5)?),

            orderbook_symbols,
            orderbook_levels,
            orderbook_update_interval: Duration::from_secs_f64(env_parse(
                "ORDERBOOK_UPDATE_INTERVAL",
                1.0,
            )?),
            orderbook_retry_delay: Duration::from_secs_f64(env_parse("ORDERBOOK_RETRY_DELAY", 1.0)?),
            orderbook_max_retries: env_parse("ORDERBOOK_MAX_RETRIES", 3)?,

            ws_ping_interval: Duration::from_secs(env_parse("WEBSOCKET_PING_INTERVAL", 30)?),
            ws_pong_timeout: Duration::from_secs(env_parse("WEBSOCKET_PONG_TIMEOUT", 60)?),
            ws_cleanup_interval: Duration::from_secs(env_parse("WEBSOCKET_CLEANUP_INTERVAL", 120)?),
        })
    }

    /// Redis连接URL
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("{key}={raw} 解析失败: {e}"))),
        Err(_) => Ok(default),
    }
}

fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 解析 YYYY-MM-DD 格式的日期字符串为UTC零点
fn parse_date_string(date_str: &str) -> Result<DateTime<Utc>> {
    let naive_date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")?;

    let naive_datetime = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::ConfigError(format!("Invalid time: {}", date_str)))?;

    Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive_datetime, Utc))
}
