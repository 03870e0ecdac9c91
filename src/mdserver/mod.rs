// 分发端：聚合、WebSocket枢纽、查询层
pub mod aggregator;
pub mod hub;
pub mod web;

pub use aggregator::{AggregatedCandle, CandleAggregator};
pub use hub::{Hub, HubCommand};
