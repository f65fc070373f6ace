//! 指标处理器
//! 提供 /metrics 端点

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::middleware::AppState;

/// 指标响应
#[derive(Serialize)]
pub struct MetricsResponse {
    pub db_pool_size: u32,
    pub db_pool_idle: u32,
    pub system_load: f64,
    pub process_uptime_secs: u64,
}

/// 指标暴露端点
/// 简化实现：返回运行时快照，完整指标由 metrics 管道导出
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> Json<MetricsResponse> {
    crate::db::record_pool_metrics(&state.db);

    Json(MetricsResponse {
        db_pool_size: state.db.size(),
        db_pool_idle: state.db.num_idle() as u32,
        system_load: state.rate_limit_service.load_tracker().current_load(),
        process_uptime_secs: crate::handlers::health::get_uptime(),
    })
}
