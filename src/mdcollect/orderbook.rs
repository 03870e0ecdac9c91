use crate::mdcollect::candle::sleep_or_shutdown;
use crate::mdcommon::{BinanceApi, Broker, Config, Database, OrderBookSnapshot};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 深度快照采集器，每个交易对一个独立任务
///
/// 按固定间隔抓取深度、打本地毫秒时间戳、入库并发布。上游
/// lastUpdateId 未变化时仍然记录（时间戳不同即主键不同），
/// 形成快照时间序列；消费方可按 last_update_id 去重。
pub struct OrderBookCollector {
    symbol: String,
    db: Arc<Database>,
    api: Arc<BinanceApi>,
    broker: Broker,
    config: Arc<Config>,
}

impl OrderBookCollector {
    pub fn new(
        symbol: String,
        db: Arc<Database>,
        api: Arc<BinanceApi>,
        broker: Broker,
        config: Arc<Config>,
    ) -> Self {
        Self { symbol, db, api, broker, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(target: "orderbook", "{}: 深度采集启动，档位 {}，间隔 {:?}",
            self.symbol, self.config.orderbook_levels, self.config.orderbook_update_interval);

        let mut ticker = tokio::time::interval(self.config.orderbook_update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                    continue;
                }
            }

            let depth = match self.api.fetch_depth(&self.symbol, self.config.orderbook_levels).await {
                Ok(depth) => depth,
                Err(e) => {
                    error!(target: "orderbook", "{}: 深度抓取失败: {}", self.symbol, e);
                    if sleep_or_shutdown(self.config.orderbook_retry_delay, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let snapshot = OrderBookSnapshot {
                symbol: self.symbol.clone(),
                timestamp: Utc::now().timestamp_millis(),
                last_update_id: depth.last_update_id,
                bids: depth.bids,
                asks: depth.asks,
            };

            if !snapshot.is_well_formed() {
                warn!(target: "orderbook", "{}: 深度快照排序异常 last_update_id={}",
                    self.symbol, snapshot.last_update_id);
            }

            if let Err(e) = self.db.insert_orderbook(&snapshot).await {
                error!(target: "orderbook", "{}: 深度入库失败: {}", self.symbol, e);
                if sleep_or_shutdown(self.config.orderbook_retry_delay, &mut shutdown).await {
                    break;
                }
                continue;
            }

            self.broker.publish_orderbook(&snapshot).await;
        }

        info!(target: "orderbook", "{}: 深度采集任务已退出", self.symbol);
    }
}
