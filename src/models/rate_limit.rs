//! 限流领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 固定窗口计数记录
/// `window_start` 为按窗口长度向下取整后的毫秒时间戳
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitWindow {
    pub key_id: String,
    pub window_start: i64,
    pub request_count: i64,
}

/// 单次限流检查结果
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitCheck {
    /// 被检查的维度键，例如 "apiKey:ak_x9f2k1q0"
    pub key_id: String,
    pub allowed: bool,
    pub remaining: u32,
    /// 窗口重置时间（毫秒时间戳）
    pub reset_at: i64,
    /// 本次检查实际生效的上限（含自适应/行为调整）
    pub limit: u32,
}

/// 多层限流检查参数
/// 每个维度可单独缺省；缺省的维度不检查也不消耗
#[derive(Debug, Clone, Default)]
pub struct MultiLayerParams {
    pub api_key_id: Option<String>,
    pub api_key_limit: Option<u32>,
    pub user_id: Option<Uuid>,
    pub user_limit: Option<u32>,
    pub ip_address: Option<String>,
    pub ip_limit: Option<u32>,
    /// 缺省时使用配置的全局窗口长度
    pub window_ms: Option<i64>,
}

/// 多层检查的配额消耗策略
///
/// `ConsumeAll` 保留原始行为：即使前一维度已拒绝，后续维度仍被消耗。
/// `StopOnDenial` 在首个拒绝后不再消耗后续维度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    ConsumeAll,
    StopOnDenial,
}

impl Default for ConsumptionPolicy {
    fn default() -> Self {
        Self::ConsumeAll
    }
}

/// 用户行为画像（进程内，按用户）
#[derive(Debug, Clone)]
pub struct UserBehaviorProfile {
    pub request_count: u64,
    /// 指数滑动平均错误率，钳制在 [0, 1]
    pub error_rate: f64,
    pub last_activity: DateTime<Utc>,
    /// 一旦置位即永久保持
    pub suspicious_activity: bool,
    /// 信誉分，钳制在 [0, 100]
    pub reputation: f64,
}

impl UserBehaviorProfile {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            error_rate: 0.0,
            last_activity: now,
            suspicious_activity: false,
            reputation: 50.0,
        }
    }
}
