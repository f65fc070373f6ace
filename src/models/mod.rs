//! 数据模型模块
//! 审计事件、限流窗口与 API Key 模型

pub mod api_key;
pub mod audit;
pub mod rate_limit;
