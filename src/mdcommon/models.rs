use crate::mdcommon::decimal::normalize_or_zero;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一分钟K线，入库后不再变更
///
/// (symbol, timestamp) 为主键，timestamp 为开盘时间的毫秒时间戳。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// 开盘时间毫秒时间戳，与 open_time 等值
    pub timestamp: i64,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
    pub taker_buy_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
}

impl Candle {
    /// 从上游12字段原始数组构造K线
    ///
    /// 数组结构: [openTime, o, h, l, c, vol, closeTime, quoteVol,
    /// trades, takerBuyBase, takerBuyQuote, ignored]。
    /// 结构性缺失返回None；数值字符串解析失败按0处理并告警。
    pub fn from_raw_kline(symbol: &str, raw: &[Value]) -> Option<Self> {
        if raw.len() < 12 {
            return None;
        }

        let timestamp = raw[0].as_i64()?;
        let close_time_ms = raw[6].as_i64()?;

        Some(Self {
            symbol: symbol.to_string(),
            timestamp,
            open_time: Utc.timestamp_millis_opt(timestamp).single()?,
            close_time: Utc.timestamp_millis_opt(close_time_ms).single()?,
            open: decimal_field(&raw[1]),
            high: decimal_field(&raw[2]),
            low: decimal_field(&raw[3]),
            close: decimal_field(&raw[4]),
            volume: decimal_field(&raw[5]),
            quote_volume: decimal_field(&raw[7]),
            trades: raw[8].as_i64().unwrap_or(0),
            taker_buy_volume: decimal_field(&raw[9]),
            taker_buy_quote_volume: decimal_field(&raw[10]),
        })
    }

    /// OHLC不变量检查，仅用于测试和采集端的防御性日志
    pub fn is_valid(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.low <= self.high
            && self.volume >= Decimal::ZERO
            && self.quote_volume >= Decimal::ZERO
            && self.trades >= 0
            && self.taker_buy_volume >= Decimal::ZERO
            && self.taker_buy_quote_volume >= Decimal::ZERO
    }
}

/// 数值字段既可能是字符串也可能是裸数字
fn decimal_field(value: &Value) -> Decimal {
    match value {
        Value::String(s) => normalize_or_zero(s),
        other => normalize_or_zero(&other.to_string()),
    }
}

/// 总线上 candles:* 频道的载荷：一根已收盘的1分钟K线
///
/// Decimal字段序列化为十进制字符串，永不出现科学计数法。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub symbol: String,
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
}

impl From<&Candle> for CandleUpdate {
    fn from(candle: &Candle) -> Self {
        Self {
            symbol: candle.symbol.clone(),
            timestamp: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            quote_volume: candle.quote_volume,
            trades: candle.trades,
        }
    }
}

/// 深度档位：价格与数量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// 深度快照，追加写入，不修改历史
///
/// bids按价格降序、asks按价格升序，档位数不超过配置档位。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// 采集时刻的本地毫秒时间戳
    pub timestamp: i64,
    pub last_update_id: i64,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

impl OrderBookSnapshot {
    /// 深度不变量：bids严格降序、asks严格升序、最优买不高于最优卖
    pub fn is_well_formed(&self) -> bool {
        let bids_sorted = self.bids.windows(2).all(|pair| pair[0].price > pair[1].price);
        let asks_sorted = self.asks.windows(2).all(|pair| pair[0].price < pair[1].price);
        let uncrossed = match (self.bids.first(), self.asks.first()) {
            (Some(best_bid), Some(best_ask)) => best_bid.price <= best_ask.price,
            _ => true,
        };
        bids_sorted && asks_sorted && uncrossed
    }

    /// 按请求档位截断，返回新快照
    pub fn truncated(&self, levels: usize) -> Self {
        Self {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            last_update_id: self.last_update_id,
            bids: self.bids.iter().take(levels).cloned().collect(),
            asks: self.asks.iter().take(levels).cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn raw_kline() -> Vec<Value> {
        json!([
            1735689600000i64,
            "95000.01",
            "95100.00",
            "94900.00",
            "95050.55",
            "12.34567890",
            1735689659999i64,
            "1172839.50",
            321,
            "6.17283945",
            "586419.75",
            "0"
        ])
        .as_array()
        .unwrap()
        .clone()
    }

    #[test]
    fn test_from_raw_kline() {
        let candle = Candle::from_raw_kline("BTCUSDT", &raw_kline()).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.timestamp, 1735689600000);
        assert_eq!(candle.open, dec!(95000.01));
        assert_eq!(candle.close, dec!(95050.55));
        assert_eq!(candle.trades, 321);
        assert_eq!(candle.close_time.timestamp_millis(), 1735689659999);
        assert!(candle.is_valid());
    }

    #[test]
    fn test_from_raw_kline_short_array() {
        let raw = vec![json!(1735689600000i64), json!("1.0")];
        assert!(Candle::from_raw_kline("BTCUSDT", &raw).is_none());
    }

    #[test]
    fn test_scientific_volume_roundtrip() {
        let mut raw = raw_kline();
        raw[5] = json!("5E-8");
        let candle = Candle::from_raw_kline("SHIBUSDT", &raw).unwrap();
        assert_eq!(candle.volume, dec!(0.00000005));

        // 广播载荷里必须是十进制字符串
        let update = CandleUpdate::from(&candle);
        let payload = serde_json::to_string(&update).unwrap();
        assert!(payload.contains("\"0.00000005\""));
        assert!(!payload.contains("5E-8"));
    }

    #[test]
    fn test_orderbook_truncated() {
        let snapshot = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 1735689600000,
            last_update_id: 42,
            bids: (0..20)
                .map(|i| OrderBookLevel {
                    price: Decimal::from(95000 - i),
                    quantity: dec!(0.5),
                })
                .collect(),
            asks: (0..20)
                .map(|i| OrderBookLevel {
                    price: Decimal::from(95001 + i),
                    quantity: dec!(0.5),
                })
                .collect(),
        };

        let truncated = snapshot.truncated(5);
        assert_eq!(truncated.bids.len(), 5);
        assert_eq!(truncated.asks.len(), 5);
        // 最优档位保留
        assert_eq!(truncated.bids[0].price, Decimal::from(95000));
        assert_eq!(truncated.asks[0].price, Decimal::from(95001));
        assert!(truncated.is_well_formed());
    }

    #[test]
    fn test_crossed_book_detected() {
        let snapshot = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 1735689600000,
            last_update_id: 1,
            bids: vec![OrderBookLevel { price: dec!(95002), quantity: dec!(1) }],
            asks: vec![OrderBookLevel { price: dec!(95001), quantity: dec!(1) }],
        };
        assert!(!snapshot.is_well_formed());
    }
}
