use chrono::{Datelike, TimeZone, Utc};
use market_server::mdcommon::CandleUpdate;
use market_server::mdserver::aggregator::period_start_ms;
use market_server::mdserver::{AggregatedCandle, CandleAggregator};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const MINUTE_MS: i64 = 60_000;
// 2025-01-01 09:00:00 UTC
const NINE_AM: i64 = 1735722000000;

// 构造一根1分钟K线
fn minute_candle(ts: i64, close: Decimal) -> CandleUpdate {
    CandleUpdate {
        symbol: "BTCUSDT".to_string(),
        timestamp: ts,
        open: close - dec!(0.5),
        high: close + dec!(1),
        low: close - dec!(2),
        close,
        volume: dec!(10),
        quote_volume: dec!(1000),
        trades: 100,
    }
}

// 四价相同的平盘K线，便于核对聚合后的OHLC
fn flat_candle(ts: i64, price: Decimal) -> CandleUpdate {
    CandleUpdate {
        symbol: "BTCUSDT".to_string(),
        timestamp: ts,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: dec!(10),
        quote_volume: dec!(1000),
        trades: 100,
    }
}

// 按给定收盘价序列依次喂入，收集所有收盘K线
fn feed(session: &mut CandleAggregator, candles: &[CandleUpdate]) -> Vec<AggregatedCandle> {
    candles
        .iter()
        .filter_map(|candle| session.add_minute_candle(candle))
        .collect()
}

#[test]
fn test_five_minute_aggregation() {
    let mut session = CandleAggregator::new("BTCUSDT", "5");

    // 09:00..09:04 五根1分钟K线，价格 100, 101, 99, 102, 103
    let prices = [dec!(100), dec!(101), dec!(99), dec!(102), dec!(103)];
    for (i, price) in prices.iter().enumerate() {
        let result = session.add_minute_candle(&flat_candle(NINE_AM + i as i64 * MINUTE_MS, *price));
        assert!(result.is_none(), "周期未结束不应收盘");
    }

    // 第六根输入落在 09:05，触发 09:00 周期收盘
    let closed = session
        .add_minute_candle(&flat_candle(NINE_AM + 5 * MINUTE_MS, dec!(104)))
        .expect("09:05 的输入应触发收盘");

    assert_eq!(closed.timestamp, NINE_AM, "收盘K线的周期起点应为 09:00");
    assert_eq!(closed.open, dec!(100), "开盘价取首根");
    assert_eq!(closed.high, dec!(103), "最高价取五根中的最大值");
    assert_eq!(closed.low, dec!(99), "最低价取五根中的最小值");
    assert_eq!(closed.close, dec!(103), "收盘价取末根");
    assert_eq!(closed.volume, dec!(50), "成交量求和");
    assert_eq!(closed.quote_volume, dec!(5000), "成交额求和");
    assert_eq!(closed.trades, 500, "成交笔数求和");
}

#[test]
fn test_late_duplicate_after_close_is_ignored() {
    let mut session = CandleAggregator::new("BTCUSDT", "5");

    for i in 0..6 {
        session.add_minute_candle(&minute_candle(NINE_AM + i * MINUTE_MS, dec!(100)));
    }
    let current_before = session.current_candle().unwrap();

    // 09:02 的重复K线在收盘后再次投递，聚合器不得产生任何输出
    let replay = session.add_minute_candle(&minute_candle(NINE_AM + 2 * MINUTE_MS, dec!(999)));
    assert!(replay.is_none(), "迟到的重复输入应被忽略");

    // 当前进行中的周期也不受影响
    let current_after = session.current_candle().unwrap();
    assert_eq!(current_before.volume, current_after.volume);
    assert_eq!(current_before.close, current_after.close);
}

#[test]
fn test_duplicates_never_double_count() {
    // 同一份输入重复喂入，收盘结果必须与喂一遍完全一致
    let inputs: Vec<CandleUpdate> = (0..10)
        .map(|i| minute_candle(NINE_AM + i * MINUTE_MS, dec!(100) + Decimal::from(i)))
        .collect();

    let mut once = CandleAggregator::new("BTCUSDT", "5");
    let closed_once = feed(&mut once, &inputs);

    let mut twice = CandleAggregator::new("BTCUSDT", "5");
    let doubled: Vec<CandleUpdate> = inputs
        .iter()
        .flat_map(|candle| [candle.clone(), candle.clone()])
        .collect();
    let closed_twice = feed(&mut twice, &doubled);

    assert_eq!(closed_once.len(), closed_twice.len());
    for (a, b) in closed_once.iter().zip(closed_twice.iter()) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.volume, b.volume, "重复投递不得重复累计成交量");
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.close, b.close);
    }
}

#[test]
fn test_consecutive_closed_periods_are_contiguous() {
    let mut session = CandleAggregator::new("BTCUSDT", "5");

    // 连续20分钟的输入，应产生首尾相接的5分钟收盘K线
    let inputs: Vec<CandleUpdate> = (0..20)
        .map(|i| minute_candle(NINE_AM + i * MINUTE_MS, dec!(100)))
        .collect();
    let closed = feed(&mut session, &inputs);

    assert_eq!(closed.len(), 3);
    for pair in closed.windows(2) {
        assert_eq!(
            pair[1].timestamp,
            pair[0].timestamp + 5 * MINUTE_MS,
            "相邻收盘K线的周期起点应相差整一个周期"
        );
    }
}

#[test]
fn test_one_minute_timeframe_passthrough() {
    let mut session = CandleAggregator::new("BTCUSDT", "1");

    let closed = session
        .add_minute_candle(&minute_candle(NINE_AM, dec!(100)))
        .expect("1分钟周期每根输入即收盘");
    assert_eq!(closed.timestamp, NINE_AM);
    assert_eq!(closed.close, dec!(100));
}

#[test]
fn test_weekly_period_starts_monday() {
    // 一整周内任意时刻都应对齐到同一个周一零点
    let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
    for day in 0..7 {
        let ts = monday + day * 24 * 3600 * 1000 + 12 * 3600 * 1000;
        let start = period_start_ms(ts, 10080);
        assert_eq!(start, monday, "第{}天应归入同一周", day);

        let dt = Utc.timestamp_millis_opt(start).unwrap();
        assert_eq!(dt.weekday().num_days_from_monday(), 0, "周线起点必须是周一");
    }

    // 下一周的输入落入新周期
    let next_monday = monday + 7 * 24 * 3600 * 1000;
    assert_eq!(period_start_ms(next_monday, 10080), next_monday);
}

#[test]
fn test_monthly_period_starts_first_of_month() {
    // 1月31日深夜与2月1日凌晨分属两个月周期
    let late_january = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 0).unwrap().timestamp_millis();
    let early_february = Utc.with_ymd_and_hms(2025, 2, 1, 0, 1, 0).unwrap().timestamp_millis();

    let jan_start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
    let feb_start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap().timestamp_millis();

    assert_eq!(period_start_ms(late_january, 43200), jan_start);
    assert_eq!(period_start_ms(early_february, 43200), feb_start);
}

#[test]
fn test_monthly_aggregation_closes_on_month_boundary() {
    let mut session = CandleAggregator::new("BTCUSDT", "1M");

    let late_january = Utc.with_ymd_and_hms(2025, 1, 31, 23, 58, 0).unwrap().timestamp_millis();
    assert!(session.add_minute_candle(&minute_candle(late_january, dec!(100))).is_none());
    assert!(session
        .add_minute_candle(&minute_candle(late_january + MINUTE_MS, dec!(101)))
        .is_none());

    // 跨入2月的第一根输入触发1月K线收盘
    let closed = session
        .add_minute_candle(&minute_candle(late_january + 2 * MINUTE_MS, dec!(102)))
        .expect("跨月输入应触发上月收盘");

    let jan_start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
    assert_eq!(closed.timestamp, jan_start);
    assert_eq!(closed.close, dec!(101));
}
