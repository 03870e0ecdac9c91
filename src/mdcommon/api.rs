use crate::mdcommon::config::Config;
use crate::mdcommon::decimal::normalize_or_zero;
use crate::mdcommon::error::{AppError, Result};
use crate::mdcommon::models::{Candle, OrderBookLevel};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, warn};

/// 深度接口的原始响应
#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// 深度抓取结果，时间戳由采集方打
#[derive(Debug, Clone)]
pub struct Depth {
    pub last_update_id: i64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

/// 上游行情API客户端
///
/// 每个交易对的采集循环串行调用本客户端，请求速率天然受
/// 采集间隔约束，无需额外限流。
#[derive(Debug, Clone)]
pub struct BinanceApi {
    base_url: String,
    client: Client,
    interval: String,
    batch_size: i64,
    retry_delay: Duration,
    max_retries: usize,
    orderbook_retry_delay: Duration,
    orderbook_max_retries: usize,
}

impl BinanceApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36")
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        Ok(Self {
            base_url: config.binance_base_url.clone(),
            client,
            interval: config.interval.clone(),
            batch_size: config.batch_size,
            retry_delay: config.retry_delay,
            max_retries: config.max_retries,
            orderbook_retry_delay: config.orderbook_retry_delay,
            orderbook_max_retries: config.orderbook_max_retries,
        })
    }

    /// 抓取一批1分钟K线，单次最多1000根
    ///
    /// 429按退避计划重试；其他4xx视为该次调用的致命错误；
    /// 5xx和网络错误重试。重试耗尽返回 UpstreamUnavailable。
    pub async fn fetch_klines(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.base_url, symbol, self.interval, start_ms, end_ms, self.batch_size
        );

        for attempt in 0..self.max_retries {
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw: Vec<Vec<Value>> = response.json().await?;
                        return Ok(self.parse_klines(symbol, &raw));
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(target: "api", "{}: 触发限频(429)，退避后重试 ({}/{})",
                            symbol, attempt + 1, self.max_retries);
                    } else if status.is_client_error() {
                        // 非429的4xx不可能靠重试恢复
                        let text = response.text().await.unwrap_or_default();
                        return Err(AppError::ApiError(format!(
                            "{}: klines 请求被拒绝: {} - {}",
                            symbol, status, text
                        )));
                    } else {
                        error!(target: "api", "{}: klines HTTP {} ({}/{})",
                            symbol, status, attempt + 1, self.max_retries);
                    }
                }
                Err(e) => {
                    error!(target: "api", "{}: klines 请求失败 ({}/{}): {}",
                        symbol, attempt + 1, self.max_retries, e);
                }
            }

            if attempt + 1 < self.max_retries {
                tokio::time::sleep(backoff_delay(self.retry_delay, attempt)).await;
            }
        }

        Err(AppError::UpstreamUnavailable(format!(
            "{}: klines 重试{}次均失败",
            symbol, self.max_retries
        )))
    }

    fn parse_klines(&self, symbol: &str, raw: &[Vec<Value>]) -> Vec<Candle> {
        let candles: Vec<Candle> = raw
            .iter()
            .filter_map(|item| Candle::from_raw_kline(symbol, item))
            .collect();

        if candles.len() != raw.len() {
            warn!(target: "api", "{}: 解析了 {}/{} 条K线，部分数据结构异常",
                symbol, candles.len(), raw.len());
        }

        candles
    }

    /// 抓取一次深度快照，档位只允许 5/10/20
    pub async fn fetch_depth(&self, symbol: &str, levels: usize) -> Result<Depth> {
        let url = format!(
            "{}/api/v3/depth?symbol={}&limit={}",
            self.base_url, symbol, levels
        );

        for attempt in 0..self.orderbook_max_retries {
            let request = self.client.get(&url).timeout(Duration::from_secs(10));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let raw: DepthResponse = response.json().await?;
                        return Ok(Depth {
                            last_update_id: raw.last_update_id,
                            bids: parse_levels(&raw.bids),
                            asks: parse_levels(&raw.asks),
                        });
                    } else if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(target: "api", "{}: 深度接口限频(429)，退避后重试 ({}/{})",
                            symbol, attempt + 1, self.orderbook_max_retries);
                    } else if status.is_client_error() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(AppError::ApiError(format!(
                            "{}: depth 请求被拒绝: {} - {}",
                            symbol, status, text
                        )));
                    } else {
                        error!(target: "api", "{}: depth HTTP {} ({}/{})",
                            symbol, status, attempt + 1, self.orderbook_max_retries);
                    }
                }
                Err(e) => {
                    error!(target: "api", "{}: depth 请求失败 ({}/{}): {}",
                        symbol, attempt + 1, self.orderbook_max_retries, e);
                }
            }

            if attempt + 1 < self.orderbook_max_retries {
                tokio::time::sleep(backoff_delay(self.orderbook_retry_delay, attempt)).await;
            }
        }

        Err(AppError::UpstreamUnavailable(format!(
            "{}: depth 重试{}次均失败",
            symbol, self.orderbook_max_retries
        )))
    }
}

fn parse_levels(raw: &[[String; 2]]) -> Vec<OrderBookLevel> {
    raw.iter()
        .map(|[price, quantity]| OrderBookLevel {
            price: normalize_or_zero(price),
            quantity: normalize_or_zero(quantity),
        })
        .collect()
}

/// 指数退避：RETRY_DELAY × 2^attempt
fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    base * (1u32 << attempt.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 4), Duration::from_secs(16));
    }

    #[test]
    fn test_parse_depth_response() {
        let raw: DepthResponse = serde_json::from_value(json!({
            "lastUpdateId": 1027024,
            "bids": [["95000.01", "1.5"], ["94999.99", "0.25"]],
            "asks": [["95000.02", "2.0"]]
        }))
        .unwrap();

        assert_eq!(raw.last_update_id, 1027024);
        let bids = parse_levels(&raw.bids);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, dec!(95000.01));
        assert_eq!(bids[1].quantity, dec!(0.25));
    }
}
