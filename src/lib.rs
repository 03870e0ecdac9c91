// 导出模块
pub mod mdcollect;
pub mod mdcommon;
pub mod mdserver;

// Re-export error types
pub use mdcommon::error::{AppError, Result};
