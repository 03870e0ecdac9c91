// 导出共享模块
pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod decimal;
pub mod error;
pub mod models;

// 重新导出常用类型，方便使用
pub use api::{BinanceApi, Depth};
pub use broker::{Broker, BrokerEvent};
pub use config::{Config, ORDERBOOK_DEFAULT_LEVELS, ORDERBOOK_SUPPORTED_LEVELS, TIMEFRAMES};
pub use db::Database;
pub use decimal::{normalize_decimal, normalize_or_zero};
pub use error::{AppError, Result};
pub use models::{Candle, CandleUpdate, OrderBookLevel, OrderBookSnapshot};
