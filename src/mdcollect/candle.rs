use crate::mdcommon::{BinanceApi, Broker, Candle, CandleUpdate, Config, Database};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// 一分钟K线采集器，每个交易对一个独立任务
///
/// 状态机：引导 -> 历史补齐 -> 切换实时 -> 实时循环。
/// 任何单品种的故障都不影响其他品种。
pub struct CandleCollector {
    symbol: String,
    db: Arc<Database>,
    api: Arc<BinanceApi>,
    broker: Broker,
    config: Arc<Config>,
}

/// 计算补齐起点：从上次检查点的下一分钟开始，但不早于配置的起始日期
pub fn bootstrap_start(last_timestamp: Option<i64>, start_date_ms: i64) -> i64 {
    match last_timestamp {
        Some(last) => (last + 60_000).max(start_date_ms),
        None => start_date_ms,
    }
}

impl CandleCollector {
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
        let hwm = self.run_historical(&mut shutdown).await;

        if *shutdown.borrow() {
            info!(target: "collector", "{}: 历史补齐阶段收到关闭信号，退出", self.symbol);
            return;
        }

        // 切换实时，is_realtime 每次进程生命周期内只翻转一次
        if hwm > 0 {
            if let Err(e) = self.db.upsert_state(&self.symbol, hwm, true).await {
                error!(target: "collector", "{}: 切换实时状态写入失败: {}", self.symbol, e);
            }
        }
        info!(target: "collector", "{}: 历史数据已追平，进入实时采集", self.symbol);

        self.run_realtime(hwm, &mut shutdown).await;
    }

    /// 历史补齐：按批抓取直到追上当前时间
    ///
    /// 返回最后入库的K线时间戳，作为实时阶段的高水位起点。
    async fn run_historical(&self, shutdown: &mut watch::Receiver<bool>) -> i64 {
        let mut start = loop {
            match self.db.get_last_timestamp(&self.symbol).await {
                Ok(last) => break bootstrap_start(last, self.config.start_date_ms),
                Err(e) => {
                    error!(target: "collector", "{}: 读取检查点失败: {}", self.symbol, e);
                    if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        return 0;
                    }
                }
            }
        };

        let mut hwm = start - 60_000;
        info!(target: "collector", "{}: 开始历史补齐，起点 {}", self.symbol, start);

        loop {
            if *shutdown.borrow() {
                return hwm;
            }

            let now = Utc::now().timestamp_millis();
            if start + 60_000 > now {
                break;
            }

            let end = (start + self.config.batch_size * 60_000).min(now);
            let candles = match self.api.fetch_klines(&self.symbol, start, end).await {
                Ok(candles) => candles,
                Err(e) => {
                    error!(target: "collector", "{}: 历史批次抓取失败: {}", self.symbol, e);
                    if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        return hwm;
                    }
                    continue;
                }
            };

            if candles.is_empty() {
                warn!(target: "collector", "{}: 上游返回空批次，一分钟后重试", self.symbol);
                if sleep_or_shutdown(Duration::from_secs(60), shutdown).await {
                    return hwm;
                }
                continue;
            }

            let last_ts = candles.last().map(|c| c.timestamp).unwrap_or(start);
            match self.db.insert_candles(&candles).await {
                Ok(inserted) => {
                    info!(target: "collector", "{}: 补齐 {} 条K线（新入库 {}），推进到 {}",
                        self.symbol, candles.len(), inserted, last_ts);
                }
                Err(e) => {
                    // 入库失败重抓同一窗口，绝不跳批
                    error!(target: "collector", "{}: 历史批次入库失败: {}", self.symbol, e);
                    if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        return hwm;
                    }
                    continue;
                }
            }

            if let Err(e) = self.db.upsert_state(&self.symbol, last_ts, false).await {
                error!(target: "collector", "{}: 检查点写入失败: {}", self.symbol, e);
            }

            hwm = last_ts;
            start = last_ts + 60_000;
        }

        info!(target: "collector", "{}: 历史补齐完成，高水位 {}", self.symbol, hwm);
        hwm
    }

    /// 实时循环：每个tick抓取最近5分钟窗口
    ///
    /// 主键去重由存储完成；只有时间戳越过高水位的K线才发布到
    /// 总线，保证每根K线恰好广播一次。
    async fn run_realtime(&self, mut hwm: i64, shutdown: &mut watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.realtime_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                    continue;
                }
            }

            let now = Utc::now().timestamp_millis();
            let window_start = now - 300_000;

            let candles = match self.api.fetch_klines(&self.symbol, window_start, now).await {
                Ok(candles) => candles,
                Err(e) => {
                    error!(target: "collector", "{}: 实时窗口抓取失败: {}", self.symbol, e);
                    if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if candles.is_empty() {
                continue;
            }

            if let Err(e) = self.db.insert_candles(&candles).await {
                error!(target: "collector", "{}: 实时批次入库失败: {}", self.symbol, e);
                if sleep_or_shutdown(self.config.retry_delay, shutdown).await {
                    break;
                }
                continue;
            }

            let last_ts = candles.last().map(|c| c.timestamp).unwrap_or(hwm);
            if let Err(e) = self.db.upsert_state(&self.symbol, last_ts, true).await {
                error!(target: "collector", "{}: 检查点写入失败: {}", self.symbol, e);
            }

            for candle in candles.iter().filter(|c| c.timestamp > hwm) {
                self.publish(candle).await;
            }
            hwm = hwm.max(last_ts);
        }

        // 关闭前最后一次检查点
        if hwm > 0 {
            if let Err(e) = self.db.upsert_state(&self.symbol, hwm, true).await {
                error!(target: "collector", "{}: 收尾检查点写入失败: {}", self.symbol, e);
            }
        }
        info!(target: "collector", "{}: K线采集任务已退出", self.symbol);
    }

    async fn publish(&self, candle: &Candle) {
        if !candle.is_valid() {
            warn!(target: "collector", "{}: K线不变量异常 ts={}，仍按原值入库广播",
                self.symbol, candle.timestamp);
        }
        self.broker.publish_candle(&CandleUpdate::from(candle)).await;
    }
}

/// 睡眠指定时长，期间收到关闭信号则立即返回true
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START_2025: i64 = 1735689600000; // 2025-01-01T00:00:00Z

    #[test]
    fn test_bootstrap_without_checkpoint() {
        assert_eq!(bootstrap_start(None, START_2025), START_2025);
    }

    #[test]
    fn test_bootstrap_resumes_after_checkpoint() {
        // 检查点晚于起始日期：从下一分钟继续
        let last = START_2025 + 3_600_000;
        assert_eq!(bootstrap_start(Some(last), START_2025), last + 60_000);
    }

    #[test]
    fn test_bootstrap_clamped_to_start_date() {
        // 检查点早于配置起点（例如起始日期前移过）：从配置起点开始
        let stale = START_2025 - 86_400_000;
        assert_eq!(bootstrap_start(Some(stale), START_2025), START_2025);
    }
}
