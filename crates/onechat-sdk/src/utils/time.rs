//! 时间处理工具模块
//!
//! - **存储层**: 时间统一使用 UTC 毫秒时间戳
//! - **事件层**: 事件时间戳使用 UTC 秒

use chrono::Utc;

/// 当前 UTC 毫秒时间戳（用于 blob 上传路径、push id）
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 当前 UTC 秒时间戳（用于事件）
pub fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
