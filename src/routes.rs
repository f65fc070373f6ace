//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{compression::CompressionLayer, cors::CorsLayer};

use crate::{auth, handlers, middleware::AppState};

/// 请求体大小上限（1 MiB）
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 业务 API：可选 API Key 认证 + 多层限流
    // 认证层在外、限流层在内：限流先看到认证上下文才能按密钥/用户分维度
    let api_routes = Router::new()
        // 审计日志（需要认证，由 handler 的 AuthContext 提取器强制）
        .route("/api/v1/audit/events", get(handlers::audit::list_audit_events))
        .route("/api/v1/audit/verify", post(handlers::audit::verify_chain))
        .route("/api/v1/audit/export", post(handlers::audit::export_with_proof))

        // API Key 管理
        .route(
            "/api/v1/api-keys",
            post(handlers::api_key::create_api_key).get(handlers::api_key::list_api_keys),
        )
        .route("/api/v1/api-keys/{id}", delete(handlers::api_key::revoke_api_key))
        .layer(from_fn_with_state(state.clone(), crate::middleware::rate_limit_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            auth::middleware::optional_api_key_middleware,
        ));

    // 指标端点
    let metrics_routes = Router::new().route("/metrics", get(handlers::metrics::metrics_export));

    // 组合所有路由
    Router::new()
        .merge(public_routes)
        .merge(api_routes)
        .merge(metrics_routes)
        .layer(from_fn(crate::middleware::request_tracking_middleware))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
