//! HTTP 中间件
//! 请求追踪、多层速率限制、客户端 IP 解析

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::models::audit::{AuditActor, AuditDetails, AuditEventType};
use crate::models::rate_limit::MultiLayerParams;

/// 应用状态
///
/// 服务使用 Arc 包装，多个请求共享同一实例；
/// Clone 成本只是指针拷贝。
#[derive(Clone)]
pub struct AppState {
    pub config: crate::config::AppConfig,
    pub db: sqlx::PgPool,
    pub audit_service: Arc<crate::services::AuditService>,
    pub rate_limit_service: Arc<crate::services::RateLimitService>,
    pub api_key_service: Arc<crate::services::ApiKeyService>,
    pub alert_service: Arc<crate::services::AlertService>,
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    // 生成或提取 trace_id/request_id
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let uri = req.uri().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();

        let response = next.run(req).await;

        let elapsed = start.elapsed();
        let status = response.status().as_u16();

        metrics::counter!(
            "http_requests_total",
            "method" => method.clone(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            method = %method,
            uri = %uri,
            status = status,
            elapsed_ms = elapsed.as_millis(),
            "Request completed"
        );

        // 在响应头中回传 trace_id/request_id
        let mut response = response;
        if let Ok(value) = trace_id.parse() {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = request_id.parse() {
            response.headers_mut().insert("x-request-id", value);
        }

        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// 多层速率限制中间件
///
/// 按认证上下文与客户端 IP 组装维度：API Key、用户、IP。每个存在的维度
/// 都做一次原子的检查并消耗；任一维度拒绝即返回 429，放行时把最紧的
/// 剩余额度写进响应头。拒绝本身会生成审计事件。
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth = req.extensions().get::<AuthContext>().cloned();
    let client_ip = get_client_ip(req.headers(), state.config.security.trust_proxy);

    // 端点级覆盖优先于全局默认
    let endpoint_override = state.config.rate_limit.override_for_path(req.uri().path());

    let params = MultiLayerParams {
        api_key_id: auth.as_ref().map(|a| a.api_key_id.clone()),
        api_key_limit: endpoint_override.and_then(|o| o.api_key_limit),
        user_id: auth.as_ref().map(|a| a.user_id),
        user_limit: endpoint_override.and_then(|o| o.user_limit),
        ip_address: client_ip.clone(),
        ip_limit: endpoint_override.and_then(|o| o.ip_limit),
        window_ms: endpoint_override.and_then(|o| o.window_ms),
    };

    let check = state.rate_limit_service.check_multi_layer(params).await;

    if !check.allowed {
        // 限流违规写入审计轨迹；审计失败不影响限流决定
        let details = AuditDetails {
            resource_type: Some("rate_limit"),
            resource_id: Some(&check.key_id),
            success: false,
            error_message: Some("rate limit exceeded"),
            metadata: Some(serde_json::json!({
                "limit": check.limit,
                "reset_at": check.reset_at,
            })),
        };
        if let Err(err) = state
            .audit_service
            .log_event(
                AuditActor {
                    user_id: auth.as_ref().map(|a| a.user_id),
                    ip_address: client_ip.as_deref(),
                    user_agent: None,
                },
                AuditEventType::RateLimitExceeded,
                details,
            )
            .await
        {
            tracing::warn!(error = %err, "Failed to audit rate limit violation");
        }

        return Ok(rate_limited_response(&check));
    }

    let response = next.run(req).await;

    // 请求结束后回写行为画像：4xx/5xx 记为失败，401/403 视为可疑
    if let Some(auth) = auth {
        let status = response.status();
        let success = status.as_u16() < 400;
        let suspicious =
            status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
        state
            .rate_limit_service
            .record_outcome(auth.user_id, success, suspicious)
            .await;
    }

    let mut response = response;
    append_rate_limit_headers(response.headers_mut(), &check);
    Ok(response)
}

/// 组装 429 响应（带标准限流头）
fn rate_limited_response(check: &crate::models::rate_limit::RateLimitCheck) -> Response {
    let mut response = AppError::RateLimitExceeded.into_response();
    append_rate_limit_headers(response.headers_mut(), check);

    let retry_after_secs =
        ((check.reset_at - Utc::now().timestamp_millis()) / 1000).max(1);
    if let Ok(value) = retry_after_secs.to_string().parse() {
        response.headers_mut().insert("retry-after", value);
    }

    response
}

fn append_rate_limit_headers(
    headers: &mut HeaderMap,
    check: &crate::models::rate_limit::RateLimitCheck,
) {
    if let Ok(value) = check.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = check.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = check.reset_at.to_string().parse() {
        headers.insert("x-ratelimit-reset", value);
    }
}

/// 获取客户端 IP 地址
pub fn get_client_ip(headers: &HeaderMap, trust_proxy: bool) -> Option<String> {
    // 如果信任代理，从 X-Forwarded-For 获取
    if trust_proxy {
        if let Some(forwarded_for) = headers.get("x-forwarded-for") {
            if let Ok(forwarded_str) = forwarded_for.to_str() {
                // X-Forwarded-For 可能包含多个 IP，取第一个
                if let Some(first_ip) = forwarded_str.split(',').next() {
                    let trimmed = first_ip.trim();
                    if !trimmed.is_empty() {
                        return Some(trimmed.to_string());
                    }
                }
            }
        }

        // 尝试 X-Real-IP
        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(ip_str) = real_ip.to_str() {
                return Some(ip_str.to_string());
            }
        }
    }

    // 连接层地址未接入（无代理部署时由反向代理补齐）
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_or_generate_trace_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "test-trace-123".parse().unwrap());

        let trace_id = extract_or_generate_trace_id(&headers);
        assert_eq!(trace_id, "test-trace-123");

        let headers = HeaderMap::new();
        let trace_id = extract_or_generate_trace_id(&headers);
        assert!(!trace_id.is_empty());
        assert_ne!(trace_id, "test-trace-123");
    }

    #[test]
    fn test_get_client_ip_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());

        assert_eq!(get_client_ip(&headers, true).unwrap(), "10.1.2.3");
        // 不信任代理时不读取转发头
        assert!(get_client_ip(&headers, false).is_none());
    }

    #[test]
    fn test_get_client_ip_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.9.8.7".parse().unwrap());

        assert_eq!(get_client_ip(&headers, true).unwrap(), "10.9.8.7");
    }
}
