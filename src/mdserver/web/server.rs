// Web服务器实现
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::mdcommon::{AppError, Result};
use crate::mdserver::hub::{validate_params, Hub, HubCommand};
use crate::mdserver::web::{handlers, AppState};

/// 启动对外HTTP/WebSocket服务
pub async fn start_web_server(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    // 与采集端同源部署，跨域全放开
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/candles", get(handlers::candles_handler))
        .route("/orderbook", get(handlers::orderbook_handler))
        .route("/symbols", get(handlers::symbols_handler))
        .route("/price", get(handlers::price_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.api_host, state.config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址失败 {}: {}", addr, e)))?;

    info!(target: "web", "API服务器启动在 http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| AppError::WebServerError(format!("Web服务器错误: {}", e)))?;

    info!(target: "web", "API服务器已关闭");
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    symbol: Option<String>,
    timeframe: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    levels: Option<usize>,
}

/// WebSocket升级处理器
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// 单个WebSocket连接的生命周期
///
/// 握手参数非法以1008关闭；注册到枢纽后转发出站消息并上报pong；
/// 发送队列被枢纽丢弃（关闭流程）时以1000正常关闭。
async fn handle_socket(mut socket: WebSocket, params: WsParams, state: Arc<AppState>) {
    let (key, levels) = match validate_params(params.symbol, params.timeframe, params.kind, params.levels) {
        Ok(validated) => validated,
        Err(reason) => {
            warn!(target: "web", "握手参数被拒绝: {}", reason);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let (tx, mut rx) = Hub::connection_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    let registered = state
        .hub
        .send(HubCommand::Register { key: key.clone(), levels, tx, reply: reply_tx })
        .await;
    if registered.is_err() {
        return;
    }
    let Ok(conn_id) = reply_rx.await else {
        return;
    };

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // 枢纽已关闭本连接的队列，正常收尾
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::NORMAL,
                                reason: "server shutdown".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if is_pong(&text) {
                            let _ = state
                                .hub
                                .send(HubCommand::Pong { key: key.clone(), id: conn_id })
                                .await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = state
        .hub
        .send(HubCommand::Unregister { key, id: conn_id })
        .await;
}

fn is_pong(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(|t| t == "pong"))
        .unwrap_or(false)
}
