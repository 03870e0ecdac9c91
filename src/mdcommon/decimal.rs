use crate::mdcommon::error::{AppError, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// 将上游返回的数值字符串解析为精确十进制数
///
/// 上游偶尔会返回科学计数法（例如成交量 "5E-8"、哨兵值 "0E-8"），
/// 必须还原成精确值入库，不能用浮点数中转。
/// 对已规范化的字符串重复解析结果不变。
pub fn normalize_decimal(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidNumber("empty value".to_string()));
    }

    let parsed = if trimmed.contains(['e', 'E']) {
        Decimal::from_scientific(trimmed)
    } else {
        Decimal::from_str(trimmed)
    };

    parsed.map_err(|e| AppError::InvalidNumber(format!("{trimmed}: {e}")))
}

/// 解析失败时以0代替并记录警告，调用方不感知错误
pub fn normalize_or_zero(raw: &str) -> Decimal {
    match normalize_decimal(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(target: "decimal", "无效数值 {:?}，按 0 处理: {}", raw, e);
            Decimal::ZERO
        }
    }
}
