use crate::mdcommon::config::timeframe_minutes;
use crate::mdcommon::models::CandleUpdate;
use chrono::{Datelike, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const MINUTE_MS: i64 = 60_000;
const WEEK_MS: i64 = 7 * 24 * 60 * 60 * 1000;
// Unix纪元是周四，加3天偏移后整除周长即对齐到周一
const MONDAY_ALIGNMENT_OFFSET_MS: i64 = 3 * 24 * 60 * 60 * 1000;

/// 聚合周期的起点
///
/// 周内周期：不大于t的最大周期整数倍（UTC，按纪元对齐）。
/// 1W：ISO周一 00:00 UTC；1M：所在自然月的第一个UTC瞬间。
pub fn period_start_ms(timestamp_ms: i64, timeframe_minutes: i64) -> i64 {
    match timeframe_minutes {
        43200 => {
            let dt = Utc.timestamp_millis_opt(timestamp_ms).unwrap();
            Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .unwrap()
                .timestamp_millis()
        }
        10080 => {
            ((timestamp_ms + MONDAY_ALIGNMENT_OFFSET_MS) / WEEK_MS) * WEEK_MS
                - MONDAY_ALIGNMENT_OFFSET_MS
        }
        minutes => {
            let period = minutes * MINUTE_MS;
            (timestamp_ms / period) * period
        }
    }
}

/// 聚合结果，收盘K线和进行中K线共用同一形状
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedCandle {
    pub symbol: String,
    /// 周期起点毫秒时间戳
    pub timestamp: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
}

/// 进行中的部分K线，周期收盘前持续被折叠更新
#[derive(Debug, Clone)]
struct PartialCandle {
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    quote_volume: Decimal,
    trades: i64,
}

impl PartialCandle {
    fn from_input(input: &CandleUpdate) -> Self {
        Self {
            open: input.open,
            high: input.high,
            low: input.low,
            close: input.close,
            volume: input.volume,
            quote_volume: input.quote_volume,
            trades: input.trades,
        }
    }

    /// 折叠一根1分钟K线：open不动，high/low扩展，close跟随，量与笔数累加
    fn fold(&mut self, input: &CandleUpdate) {
        self.high = self.high.max(input.high);
        self.low = self.low.min(input.low);
        self.close = input.close;
        self.volume += input.volume;
        self.quote_volume += input.quote_volume;
        self.trades += input.trades;
    }
}

/// 在线K线聚合会话，每个 (symbol, timeframe) 一个
///
/// 输入是总线上的1分钟收盘K线。同一根输入重复投递或乱序到达
/// 不会被重复计数：只接受时间戳严格递增的输入。
pub struct CandleAggregator {
    symbol: String,
    timeframe_minutes: i64,
    current: Option<PartialCandle>,
    current_period_start: Option<i64>,
    last_input_ts: Option<i64>,
}

impl CandleAggregator {
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe_minutes: timeframe_minutes(timeframe).unwrap_or(1),
            current: None,
            current_period_start: None,
            last_input_ts: None,
        }
    }

    /// 喂入一根1分钟K线，周期推进时返回上一周期的收盘K线
    ///
    /// 1分钟周期直接透传（每根输入即收盘）。
    pub fn add_minute_candle(&mut self, input: &CandleUpdate) -> Option<AggregatedCandle> {
        if let Some(last) = self.last_input_ts {
            if input.timestamp <= last {
                return None;
            }
        }

        let period_start = period_start_ms(input.timestamp, self.timeframe_minutes);

        // 迟到周期的输入直接忽略
        if let Some(current_start) = self.current_period_start {
            if period_start < current_start {
                return None;
            }
        }

        self.last_input_ts = Some(input.timestamp);

        if self.timeframe_minutes == 1 {
            return Some(self.format(&PartialCandle::from_input(input), period_start));
        }

        match self.current_period_start {
            Some(current_start) if period_start == current_start => {
                if let Some(current) = self.current.as_mut() {
                    current.fold(input);
                }
                None
            }
            _ => {
                let completed = self
                    .current
                    .take()
                    .zip(self.current_period_start)
                    .map(|(candle, start)| self.format(&candle, start));

                self.current = Some(PartialCandle::from_input(input));
                self.current_period_start = Some(period_start);
                completed
            }
        }
    }

    /// 当前进行中K线，供周期性推送和 /price 查询
    pub fn current_candle(&self) -> Option<AggregatedCandle> {
        self.current
            .as_ref()
            .zip(self.current_period_start)
            .map(|(candle, start)| self.format(candle, start))
    }

    fn format(&self, candle: &PartialCandle, period_start: i64) -> AggregatedCandle {
        AggregatedCandle {
            symbol: self.symbol.clone(),
            timestamp: period_start,
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minute_alignment() {
        // 2024-01-03 12:34:56 UTC
        let ts = 1704285296000;
        assert_eq!(period_start_ms(ts, 1), 1704285240000); // 12:34:00
        assert_eq!(period_start_ms(ts, 5), 1704285000000); // 12:30:00
        assert_eq!(period_start_ms(ts, 60), 1704283200000); // 12:00:00
        assert_eq!(period_start_ms(ts, 1440), 1704240000000); // 00:00:00
    }

    #[test]
    fn test_45m_alignment_is_epoch_floor() {
        // 45分钟周期按纪元整除对齐，而不是在小时内重置
        let period = 45 * MINUTE_MS;
        let ts = 1704285296000;
        let start = period_start_ms(ts, 45);
        assert_eq!(start % period, 0);
        assert!(start <= ts && ts < start + period);
    }

    #[test]
    fn test_week_starts_monday() {
        // 2024-01-03 是周三，所在ISO周从 2024-01-01（周一）开始
        let wednesday = 1704283200000;
        let start = period_start_ms(wednesday, 10080);
        assert_eq!(start, 1704067200000);

        let dt = Utc.timestamp_millis_opt(start).unwrap();
        assert_eq!(dt.weekday().num_days_from_monday(), 0);
    }

    #[test]
    fn test_month_starts_first_of_calendar_month() {
        // 2024-02-15 12:00 UTC -> 2024-02-01 00:00 UTC
        let mid_february = 1708000000000 + 8000000;
        let start = period_start_ms(mid_february, 43200);
        let dt = Utc.timestamp_millis_opt(start).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2024, 2, 1));
        assert_eq!((dt.hour(), dt.minute()), (0, 0));
    }

    fn minute_candle(ts: i64, close: Decimal) -> CandleUpdate {
        CandleUpdate {
            symbol: "BTCUSDT".to_string(),
            timestamp: ts,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(10),
            quote_volume: dec!(1000),
            trades: 5,
        }
    }

    #[test]
    fn test_passthrough_for_one_minute_timeframe() {
        let mut session = CandleAggregator::new("BTCUSDT", "1");
        let closed = session.add_minute_candle(&minute_candle(1704285240000, dec!(100)));
        assert!(closed.is_some());
        assert_eq!(closed.unwrap().timestamp, 1704285240000);
        assert!(session.current_candle().is_none());
    }

    #[test]
    fn test_fold_within_period() {
        let mut session = CandleAggregator::new("BTCUSDT", "5");
        let base = 1704285000000; // 12:30:00

        assert!(session.add_minute_candle(&minute_candle(base, dec!(100))).is_none());
        assert!(session
            .add_minute_candle(&minute_candle(base + MINUTE_MS, dec!(105)))
            .is_none());

        let current = session.current_candle().unwrap();
        assert_eq!(current.timestamp, base);
        assert_eq!(current.open, dec!(100));
        assert_eq!(current.close, dec!(105));
        assert_eq!(current.high, dec!(106));
        assert_eq!(current.low, dec!(99));
        assert_eq!(current.volume, dec!(20));
        assert_eq!(current.trades, 10);
    }

    #[test]
    fn test_close_on_period_advance() {
        let mut session = CandleAggregator::new("BTCUSDT", "5");
        let base = 1704285000000;

        for i in 0..5 {
            assert!(session
                .add_minute_candle(&minute_candle(base + i * MINUTE_MS, dec!(100) + Decimal::from(i)))
                .is_none());
        }

        // 第六根输入落入下一个周期，触发上一周期收盘
        let closed = session
            .add_minute_candle(&minute_candle(base + 5 * MINUTE_MS, dec!(200)))
            .expect("周期推进时应收盘");

        assert_eq!(closed.timestamp, base);
        assert_eq!(closed.open, dec!(100));
        assert_eq!(closed.close, dec!(104));
        assert_eq!(closed.volume, dec!(50));
        assert_eq!(closed.trades, 25);
    }

    #[test]
    fn test_duplicate_and_late_inputs_ignored() {
        let mut session = CandleAggregator::new("BTCUSDT", "5");
        let base = 1704285000000;

        session.add_minute_candle(&minute_candle(base, dec!(100)));
        session.add_minute_candle(&minute_candle(base + MINUTE_MS, dec!(105)));
        let before = session.current_candle().unwrap();

        // 同一根重复投递
        assert!(session
            .add_minute_candle(&minute_candle(base + MINUTE_MS, dec!(105)))
            .is_none());
        // 乱序迟到
        assert!(session.add_minute_candle(&minute_candle(base, dec!(100))).is_none());

        let after = session.current_candle().unwrap();
        assert_eq!(before.volume, after.volume);
        assert_eq!(before.trades, after.trades);
        assert_eq!(before.close, after.close);
    }
}
