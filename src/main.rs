use anyhow::Result;
use market_server::mdcollect::{CandleCollector, OrderBookCollector};
use market_server::mdcommon::{BinanceApi, Broker, Config, Database};
use market_server::mdserver::web::{start_web_server, AppState};
use market_server::mdserver::Hub;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("启动行情分发服务");

    // 配置错误属于致命启动错误，退出码1
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("配置加载失败: {}", e);
            std::process::exit(1);
        }
    };

    let db = Arc::new(Database::connect(&config).await?);
    let broker = Broker::connect(&config.redis_url()).await?;
    let api = Arc::new(BinanceApi::new(&config)?);

    // 关闭信号：每个循环在当前迭代结束后退出
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();

    // 枢纽任务：连接注册表与聚合会话的唯一属主
    let (hub_tx, hub_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(1024);
    let hub = Hub::new(&config);
    handles.push(tokio::spawn(hub.run(hub_rx, events_rx, shutdown_rx.clone())));

    // 总线订阅任务，断线指数退避重连
    handles.push(tokio::spawn(market_server::mdcommon::broker::run_subscriber(
        config.redis_url(),
        events_tx,
        shutdown_rx.clone(),
    )));

    // 每个交易对一个独立的K线采集任务
    for symbol in &config.symbols {
        let collector = CandleCollector::new(
            symbol.clone(),
            db.clone(),
            api.clone(),
            broker.clone(),
            config.clone(),
        );
        handles.push(tokio::spawn(collector.run(shutdown_rx.clone())));
    }

    // 每个交易对一个深度采集任务
    for symbol in &config.orderbook_symbols {
        let collector = OrderBookCollector::new(
            symbol.clone(),
            db.clone(),
            api.clone(),
            broker.clone(),
            config.clone(),
        );
        handles.push(tokio::spawn(collector.run(shutdown_rx.clone())));
    }

    // 查询层与WebSocket入口
    let state = Arc::new(AppState {
        db: db.clone(),
        hub: hub_tx,
        config: config.clone(),
    });
    handles.push(tokio::spawn(async move {
        if let Err(e) = start_web_server(state, shutdown_rx).await {
            error!("Web服务器退出: {}", e);
        }
    }));

    info!(
        "全部任务已启动: {} 个K线采集 / {} 个深度采集",
        config.symbols.len(),
        config.orderbook_symbols.len()
    );

    // 等待关闭信号
    tokio::signal::ctrl_c().await?;
    info!("收到关闭信号，开始有序退出");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("行情分发服务已退出");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
