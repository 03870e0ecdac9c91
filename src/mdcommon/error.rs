use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    BrokerError(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Time parsing error: {0}")]
    TimeParseError(#[from] chrono::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Web server error: {0}")]
    WebServerError(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
