use crate::mdcommon::broker::BrokerEvent;
use crate::mdcommon::config::{
    timeframe_labels, timeframe_minutes, Config, ORDERBOOK_DEFAULT_LEVELS,
    ORDERBOOK_SUPPORTED_LEVELS, TIMEFRAMES,
};
use crate::mdcommon::models::{CandleUpdate, OrderBookSnapshot};
use crate::mdserver::aggregator::{AggregatedCandle, CandleAggregator};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// 进行中K线的推送节流间隔
pub const INTERIM_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// 单连接发送队列容量，慢客户端的更新直接丢弃
const CONNECTION_QUEUE_CAPACITY: usize = 32;

pub type ConnId = u64;

/// 订阅的数据种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Candles,
    OrderBook,
}

impl DataKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "candles" => Some(Self::Candles),
            "orderbook" => Some(Self::OrderBook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Candles => "candles",
            Self::OrderBook => "orderbook",
        }
    }
}

/// 连接注册表的键：(symbol, timeframe, 数据种类)
///
/// symbol 为 "all" 时接收同 (timeframe, 种类) 下所有品种的事件。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub symbol: String,
    pub timeframe: String,
    pub kind: DataKind,
}

/// 校验WebSocket握手参数
///
/// 未知 timeframe / type / levels 返回拒绝原因，连接以1008关闭。
pub fn validate_params(
    symbol: Option<String>,
    timeframe: Option<String>,
    kind: Option<String>,
    levels: Option<usize>,
) -> std::result::Result<(StreamKey, usize), String> {
    let symbol = symbol.unwrap_or_else(|| "all".to_string());
    let timeframe = timeframe.unwrap_or_else(|| "1".to_string());
    let kind_raw = kind.unwrap_or_else(|| "candles".to_string());

    if timeframe_minutes(&timeframe).is_none() {
        return Err(format!(
            "Invalid timeframe: {}. Supported: {:?}",
            timeframe,
            timeframe_labels()
        ));
    }

    let kind = DataKind::parse(&kind_raw)
        .ok_or_else(|| format!("Invalid type: {}", kind_raw))?;

    let levels = levels.unwrap_or(ORDERBOOK_DEFAULT_LEVELS);
    if !ORDERBOOK_SUPPORTED_LEVELS.contains(&levels) {
        return Err(format!(
            "Invalid levels: {}. Supported: {:?}",
            levels, ORDERBOOK_SUPPORTED_LEVELS
        ));
    }

    // 深度订阅与周期无关，注册键统一落在 "1" 上
    let timeframe = match kind {
        DataKind::OrderBook => "1".to_string(),
        DataKind::Candles => timeframe,
    };

    Ok((StreamKey { symbol, timeframe, kind }, levels))
}

/// 推送给客户端的数据消息，kind区分收盘K线/进行中K线/深度快照
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StreamMessage<'a> {
    CandleClosed {
        #[serde(flatten)]
        candle: &'a AggregatedCandle,
    },
    CandleUpdate {
        #[serde(flatten)]
        candle: &'a AggregatedCandle,
    },
    Orderbook {
        #[serde(flatten)]
        snapshot: &'a OrderBookSnapshot,
    },
}

/// 枢纽命令，连接任务和查询层通过它与枢纽交互
pub enum HubCommand {
    Register {
        key: StreamKey,
        levels: usize,
        tx: mpsc::Sender<String>,
        reply: oneshot::Sender<ConnId>,
    },
    Unregister {
        key: StreamKey,
        id: ConnId,
    },
    Pong {
        key: StreamKey,
        id: ConnId,
    },
    /// /price 查询当前进行中K线
    CurrentCandle {
        symbol: String,
        timeframe: String,
        reply: oneshot::Sender<Option<AggregatedCandle>>,
    },
}

struct ConnectionHandle {
    tx: mpsc::Sender<String>,
    last_pong: Instant,
    is_alive: bool,
    levels: usize,
}

/// WebSocket枢纽
///
/// 连接注册表和聚合会话全部归属本任务，命令与总线事件经有界
/// 通道进入，单任务串行处理，无需任何锁。
pub struct Hub {
    connections: HashMap<StreamKey, HashMap<ConnId, ConnectionHandle>>,
    aggregators: HashMap<(String, String), CandleAggregator>,
    last_interim: HashMap<(String, String), Instant>,
    next_id: ConnId,
    ping_interval: Duration,
    pong_timeout: Duration,
    cleanup_interval: Duration,
}

impl Hub {
    pub fn new(config: &Config) -> Self {
        Self {
            connections: HashMap::new(),
            aggregators: HashMap::new(),
            last_interim: HashMap::new(),
            next_id: 1,
            ping_interval: config.ws_ping_interval,
            pong_timeout: config.ws_pong_timeout,
            cleanup_interval: config.ws_cleanup_interval,
        }
    }

    /// 新建一条连接的发送队列
    pub fn connection_channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(CONNECTION_QUEUE_CAPACITY)
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<HubCommand>,
        mut events: mpsc::Receiver<BrokerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let start = tokio::time::Instant::now();
        let mut heartbeat =
            tokio::time::interval_at(start + self.ping_interval, self.ping_interval);
        let mut interim =
            tokio::time::interval_at(start + INTERIM_UPDATE_INTERVAL, INTERIM_UPDATE_INTERVAL);
        let mut cleanup =
            tokio::time::interval_at(start + self.cleanup_interval, self.cleanup_interval);

        info!(target: "hub", "WebSocket枢纽已启动 (心跳{:?} / 超时{:?} / 清扫{:?})",
            self.ping_interval, self.pong_timeout, self.cleanup_interval);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command),
                Some(event) = events.recv() => match event {
                    BrokerEvent::Candle(candle) => self.on_candle(&candle),
                    BrokerEvent::OrderBook(snapshot) => self.on_orderbook(&snapshot),
                },
                _ = heartbeat.tick() => self.send_heartbeats(),
                _ = interim.tick() => self.send_interim_updates(Instant::now()),
                _ = cleanup.tick() => self.cleanup_stale(Instant::now()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
            }
        }

        // 丢弃全部发送端，连接任务收到通道关闭后以1000关闭socket
        let total: usize = self.connections.values().map(|set| set.len()).sum();
        self.connections.clear();
        info!(target: "hub", "枢纽关闭，断开 {} 条连接", total);
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { key, levels, tx, reply } => {
                let id = self.register(key, levels, tx);
                let _ = reply.send(id);
            }
            HubCommand::Unregister { key, id } => self.unregister(&key, id),
            HubCommand::Pong { key, id } => {
                if let Some(handle) = self.connections.get_mut(&key).and_then(|set| set.get_mut(&id)) {
                    handle.last_pong = Instant::now();
                    handle.is_alive = true;
                }
            }
            HubCommand::CurrentCandle { symbol, timeframe, reply } => {
                let current = self
                    .aggregators
                    .get(&(symbol, timeframe))
                    .and_then(|session| session.current_candle());
                let _ = reply.send(current);
            }
        }
    }

    fn register(&mut self, key: StreamKey, levels: usize, tx: mpsc::Sender<String>) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;

        let set = self.connections.entry(key.clone()).or_default();
        set.insert(
            id,
            ConnectionHandle { tx, last_pong: Instant::now(), is_alive: true, levels },
        );
        info!(target: "hub", "连接接入 {}:{}:{} (该流共 {} 条)",
            key.symbol, key.timeframe, key.kind.as_str(), set.len());
        id
    }

    fn unregister(&mut self, key: &StreamKey, id: ConnId) {
        if let Some(set) = self.connections.get_mut(key) {
            if set.remove(&id).is_some() {
                info!(target: "hub", "连接断开 {}:{}:{}", key.symbol, key.timeframe, key.kind.as_str());
            }
            if set.is_empty() {
                self.connections.remove(key);
                self.prune_idle_sessions();
            }
        }
    }

    /// 某个 (symbol, timeframe) 是否还有K线订阅者（含 all 订阅）
    fn has_candle_subscribers(&self, symbol: &str, timeframe: &str) -> bool {
        let exact = StreamKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            kind: DataKind::Candles,
        };
        let all = StreamKey {
            symbol: "all".to_string(),
            timeframe: timeframe.to_string(),
            kind: DataKind::Candles,
        };
        self.connections.get(&exact).is_some_and(|set| !set.is_empty())
            || self.connections.get(&all).is_some_and(|set| !set.is_empty())
    }

    /// 总线送来一根已收盘的1分钟K线
    fn on_candle(&mut self, candle: &CandleUpdate) {
        for (timeframe, _) in TIMEFRAMES {
            if !self.has_candle_subscribers(&candle.symbol, timeframe) {
                continue;
            }

            let session_key = (candle.symbol.clone(), timeframe.to_string());
            let session = self
                .aggregators
                .entry(session_key.clone())
                .or_insert_with(|| CandleAggregator::new(&candle.symbol, timeframe));

            if let Some(closed) = session.add_minute_candle(candle) {
                // 收盘K线不节流，立即广播
                if let Ok(payload) = serde_json::to_string(&StreamMessage::CandleClosed { candle: &closed }) {
                    self.broadcast_candle_payload(&closed.symbol, timeframe, &payload);
                }
                self.last_interim.insert(session_key, Instant::now());
            }
        }
    }

    /// 每5秒把进行中的部分K线推给订阅者
    fn send_interim_updates(&mut self, now: Instant) {
        let mut updates = Vec::new();

        for ((symbol, timeframe), session) in &self.aggregators {
            let session_key = (symbol.clone(), timeframe.clone());
            let fresh = self
                .last_interim
                .get(&session_key)
                .is_some_and(|last| now.duration_since(*last) < INTERIM_UPDATE_INTERVAL);
            if fresh {
                continue;
            }

            if let Some(current) = session.current_candle() {
                if let Ok(payload) = serde_json::to_string(&StreamMessage::CandleUpdate { candle: &current }) {
                    updates.push((symbol.clone(), timeframe.clone(), payload));
                }
            }
        }

        for (symbol, timeframe, payload) in updates {
            self.broadcast_candle_payload(&symbol, &timeframe, &payload);
            self.last_interim.insert((symbol, timeframe), now);
        }
    }

    fn broadcast_candle_payload(&mut self, symbol: &str, timeframe: &str, payload: &str) {
        for target in [symbol, "all"] {
            let key = StreamKey {
                symbol: target.to_string(),
                timeframe: timeframe.to_string(),
                kind: DataKind::Candles,
            };
            if let Some(set) = self.connections.get_mut(&key) {
                for handle in set.values_mut() {
                    send_lossy(handle, payload);
                }
            }
        }
    }

    /// 总线送来一条深度快照，按各连接请求的档位截断后广播
    fn on_orderbook(&mut self, snapshot: &OrderBookSnapshot) {
        // 同档位的载荷只序列化一次
        let mut payload_by_levels: HashMap<usize, String> = HashMap::new();

        for target in [snapshot.symbol.as_str(), "all"] {
            let key = StreamKey {
                symbol: target.to_string(),
                timeframe: "1".to_string(),
                kind: DataKind::OrderBook,
            };
            let Some(set) = self.connections.get_mut(&key) else {
                continue;
            };

            for handle in set.values_mut() {
                let payload = payload_by_levels.entry(handle.levels).or_insert_with(|| {
                    let truncated = snapshot.truncated(handle.levels);
                    serde_json::to_string(&StreamMessage::Orderbook { snapshot: &truncated })
                        .unwrap_or_default()
                });
                if !payload.is_empty() {
                    send_lossy(handle, payload);
                }
            }
        }
    }

    /// 每30秒向所有连接发送心跳
    fn send_heartbeats(&mut self) {
        let payload = format!(
            r#"{{"type":"heartbeat","timestamp":{}}}"#,
            Utc::now().timestamp_millis()
        );

        for set in self.connections.values_mut() {
            for handle in set.values_mut() {
                send_lossy(handle, &payload);
            }
        }
    }

    /// 清扫死连接：发送失败过或超过60秒未回pong的连接移除
    fn cleanup_stale(&mut self, now: Instant) {
        let timeout = self.pong_timeout;
        let mut removed = 0usize;

        self.connections.retain(|key, set| {
            set.retain(|_, handle| {
                let stale = !handle.is_alive
                    || now.duration_since(handle.last_pong) > timeout;
                if stale {
                    removed += 1;
                    debug!(target: "hub", "清除失活连接 {}:{}:{}",
                        key.symbol, key.timeframe, key.kind.as_str());
                }
                !stale
            });
            !set.is_empty()
        });

        if removed > 0 {
            info!(target: "hub", "清扫完成，移除 {} 条失活连接", removed);
        }
        self.prune_idle_sessions();
    }

    /// 回收没有任何订阅者的聚合会话
    fn prune_idle_sessions(&mut self) {
        let connections = &self.connections;
        self.aggregators.retain(|(symbol, timeframe), _| {
            let exact = StreamKey {
                symbol: symbol.clone(),
                timeframe: timeframe.clone(),
                kind: DataKind::Candles,
            };
            let all = StreamKey {
                symbol: "all".to_string(),
                timeframe: timeframe.clone(),
                kind: DataKind::Candles,
            };
            connections.get(&exact).is_some_and(|set| !set.is_empty())
                || connections.get(&all).is_some_and(|set| !set.is_empty())
        });

        let aggregators = &self.aggregators;
        self.last_interim.retain(|key, _| aggregators.contains_key(key));
    }
}

/// 有损发送：队列满丢弃本条更新（下一次推送很快会覆盖），
/// 通道关闭则标记连接待清扫。广播方永不被慢客户端阻塞。
fn send_lossy(handle: &mut ConnectionHandle, payload: &str) {
    match handle.tx.try_send(payload.to_string()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!(target: "hub", "连接队列已满，丢弃一条更新");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            handle.is_alive = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        // 测试不经过环境变量，直接构造
        Config {
            db_host: "localhost".into(),
            db_port: 5432,
            db_name: "crypto_data".into(),
            db_user: "crypto_user".into(),
            db_password: "crypto_pass".into(),
            redis_host: "localhost".into(),
            redis_port: 6379,
            api_host: "127.0.0.1".into(),
            api_port: 8000,
            binance_base_url: "https://api.binance.com".into(),
            symbols: vec!["BTCUSDT".into()],
            start_date_ms: 1735689600000,
            interval: "1m".into(),
            batch_size: 1000,
            retry_delay: Duration::from_secs(1),
            max_retries: 5,
            realtime_interval: Duration::from_millis(500),
            orderbook_symbols: vec!["BTCUSDT".into()],
            orderbook_levels: 20,
            orderbook_update_interval: Duration::from_secs(1),
            orderbook_retry_delay: Duration::from_secs(1),
            orderbook_max_retries: 3,
            ws_ping_interval: Duration::from_secs(30),
            ws_pong_timeout: Duration::from_secs(60),
            ws_cleanup_interval: Duration::from_secs(120),
        }
    }

    fn candles_key(symbol: &str, timeframe: &str) -> StreamKey {
        StreamKey {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            kind: DataKind::Candles,
        }
    }

    fn minute_candle(ts: i64) -> CandleUpdate {
        CandleUpdate {
            symbol: "BTCUSDT".to_string(),
            timestamp: ts,
            open: dec!(100),
            high: dec!(101),
            low: dec!(99),
            close: dec!(100.5),
            volume: dec!(10),
            quote_volume: dec!(1000),
            trades: 5,
        }
    }

    #[test]
    fn test_validate_params_defaults() {
        let (key, levels) = validate_params(None, None, None, None).unwrap();
        assert_eq!(key.symbol, "all");
        assert_eq!(key.timeframe, "1");
        assert_eq!(key.kind, DataKind::Candles);
        assert_eq!(levels, 20);
    }

    #[test]
    fn test_validate_params_rejects_unknown() {
        assert!(validate_params(None, Some("7".into()), None, None).is_err());
        assert!(validate_params(None, None, Some("trades".into()), None).is_err());
        assert!(validate_params(None, None, None, Some(15)).is_err());
    }

    #[tokio::test]
    async fn test_register_and_broadcast_closed_candle() {
        let mut hub = Hub::new(&test_config());
        let (tx, mut rx) = Hub::connection_channel();
        hub.register(candles_key("BTCUSDT", "5"), 20, tx);

        let base = 1704285000000;
        for i in 0..5 {
            hub.on_candle(&minute_candle(base + i * 60_000));
        }
        // 前五根都在同一周期内，只有进行中K线，无收盘广播
        assert!(rx.try_recv().is_err());

        hub.on_candle(&minute_candle(base + 5 * 60_000));
        let payload = rx.try_recv().expect("周期推进应广播收盘K线");
        assert!(payload.contains(r#""kind":"candle_closed""#));
        assert!(payload.contains(r#""timestamp":1704285000000"#));
    }

    #[tokio::test]
    async fn test_all_subscription_receives_every_symbol() {
        let mut hub = Hub::new(&test_config());
        let (tx, mut rx) = Hub::connection_channel();
        hub.register(candles_key("all", "1"), 20, tx);

        hub.on_candle(&minute_candle(1704285000000));
        let payload = rx.try_recv().expect("all订阅应收到1分钟收盘K线");
        assert!(payload.contains("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_interim_updates_are_rate_limited() {
        let mut hub = Hub::new(&test_config());
        let (tx, mut rx) = Hub::connection_channel();
        hub.register(candles_key("BTCUSDT", "5"), 20, tx);

        let base = 1704285000000;
        hub.on_candle(&minute_candle(base));

        let now = Instant::now();
        hub.send_interim_updates(now + INTERIM_UPDATE_INTERVAL);
        let payload = rx.try_recv().expect("应推送进行中K线");
        assert!(payload.contains(r#""kind":"candle_update""#));

        // 刚推送过，节流窗口内不再推送
        hub.send_interim_updates(now + INTERIM_UPDATE_INTERVAL + Duration::from_secs(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_payload_shape() {
        let mut hub = Hub::new(&test_config());
        let (tx, mut rx) = Hub::connection_channel();
        hub.register(candles_key("all", "1"), 20, tx);

        hub.send_heartbeats();
        let payload = rx.try_recv().expect("所有连接都应收到心跳");
        assert!(payload.starts_with(r#"{"type":"heartbeat","timestamp":"#));
    }

    #[tokio::test]
    async fn test_cleanup_removes_silent_connections() {
        let mut hub = Hub::new(&test_config());
        let (tx, _rx) = Hub::connection_channel();
        let key = candles_key("BTCUSDT", "1");
        hub.register(key.clone(), 20, tx);
        assert_eq!(hub.connections.len(), 1);

        // 60秒内有pong：保留
        hub.cleanup_stale(Instant::now() + Duration::from_secs(30));
        assert_eq!(hub.connections.len(), 1);

        // 超过60秒未回pong：清扫移除
        hub.cleanup_stale(Instant::now() + Duration::from_secs(61));
        assert!(hub.connections.is_empty());
    }

    #[tokio::test]
    async fn test_orderbook_truncated_per_connection() {
        let mut hub = Hub::new(&test_config());
        let (tx, mut rx) = Hub::connection_channel();
        hub.register(
            StreamKey {
                symbol: "BTCUSDT".to_string(),
                timeframe: "1".to_string(),
                kind: DataKind::OrderBook,
            },
            5,
            tx,
        );

        let snapshot = OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            timestamp: 1704285000000,
            last_update_id: 7,
            bids: (0..20)
                .map(|i| crate::mdcommon::OrderBookLevel {
                    price: rust_decimal::Decimal::from(95000 - i),
                    quantity: dec!(1),
                })
                .collect(),
            asks: (0..20)
                .map(|i| crate::mdcommon::OrderBookLevel {
                    price: rust_decimal::Decimal::from(95001 + i),
                    quantity: dec!(1),
                })
                .collect(),
        };

        hub.on_orderbook(&snapshot);
        let payload = rx.try_recv().expect("深度订阅应收到快照");
        assert!(payload.contains(r#""kind":"orderbook""#));
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["bids"].as_array().unwrap().len(), 5);
    }
}
