// 对外HTTP/WebSocket服务
pub mod handlers;
pub mod server;

use crate::mdcommon::{Config, Database};
use crate::mdserver::hub::HubCommand;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 查询层共享状态
pub struct AppState {
    pub db: Arc<Database>,
    pub hub: mpsc::Sender<HubCommand>,
    pub config: Arc<Config>,
}

pub use server::start_web_server;
