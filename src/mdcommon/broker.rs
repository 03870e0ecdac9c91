use crate::mdcommon::error::Result;
use crate::mdcommon::models::{CandleUpdate, OrderBookSnapshot};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// 订阅端收到的总线事件
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Candle(CandleUpdate),
    OrderBook(OrderBookSnapshot),
}

/// 消息总线发布端
///
/// 每个事件同时发往品种频道和汇总频道。发布失败只记日志并丢弃
/// 事件，存储才是权威数据源。
#[derive(Clone)]
pub struct Broker {
    conn: ConnectionManager,
}

impl Broker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        info!(target: "broker", "消息总线已连接: {}", redis_url);
        Ok(Self { conn })
    }

    /// 发布一根已收盘的1分钟K线到 candles:<SYMBOL> 和 candles:all
    pub async fn publish_candle(&self, update: &CandleUpdate) {
        let payload = match serde_json::to_string(update) {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "broker", "{}: K线序列化失败: {}", update.symbol, e);
                return;
            }
        };

        self.publish(&format!("candles:{}", update.symbol), &payload).await;
        self.publish("candles:all", &payload).await;
    }

    /// 发布一条深度快照到 orderbook:<SYMBOL> 和 orderbook:all
    pub async fn publish_orderbook(&self, snapshot: &OrderBookSnapshot) {
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "broker", "{}: 深度快照序列化失败: {}", snapshot.symbol, e);
                return;
            }
        };

        self.publish(&format!("orderbook:{}", snapshot.symbol), &payload).await;
        self.publish("orderbook:all", &payload).await;
    }

    async fn publish(&self, channel: &str, payload: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.publish::<_, _, i64>(channel, payload).await {
            warn!(target: "broker", "发布到 {} 失败，事件丢弃: {}", channel, e);
        }
    }
}

/// 订阅汇总频道并把解码后的事件转发给枢纽
///
/// 连接断开按指数退避重连，上限30秒；收到关闭信号后退出。
pub async fn run_subscriber(
    redis_url: String,
    events_tx: mpsc::Sender<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        if *shutdown.borrow() {
            break;
        }

        match subscribe_loop(&redis_url, &events_tx, &mut shutdown, &mut backoff).await {
            Ok(()) => break, // 正常关闭
            Err(e) => {
                error!(target: "broker", "订阅连接中断: {}，{}秒后重连", e, backoff.as_secs());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    info!(target: "broker", "总线订阅任务已退出");
}

async fn subscribe_loop(
    redis_url: &str,
    events_tx: &mpsc::Sender<BrokerEvent>,
    shutdown: &mut watch::Receiver<bool>,
    backoff: &mut Duration,
) -> Result<()> {
    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe("candles:all").await?;
    pubsub.subscribe("orderbook:all").await?;
    info!(target: "broker", "已订阅 candles:all / orderbook:all");

    // 连上即重置退避
    *backoff = Duration::from_secs(1);

    let mut stream = pubsub.on_message();

    loop {
        tokio::select! {
            message = stream.next() => {
                let Some(message) = message else {
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pubsub stream ended",
                    ))
                    .into());
                };

                let channel = message.get_channel_name().to_string();
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(target: "broker", "{}: 载荷读取失败: {}", channel, e);
                        continue;
                    }
                };

                let event = match channel.as_str() {
                    "candles:all" => serde_json::from_str::<CandleUpdate>(&payload)
                        .map(BrokerEvent::Candle),
                    "orderbook:all" => serde_json::from_str::<OrderBookSnapshot>(&payload)
                        .map(BrokerEvent::OrderBook),
                    other => {
                        debug!(target: "broker", "忽略未知频道 {}", other);
                        continue;
                    }
                };

                match event {
                    Ok(event) => {
                        // 枢纽处理不过来时在此背压等待，不丢事件
                        if events_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        warn!(target: "broker", "{}: 载荷解码失败: {}", channel, e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}
