//! API Key 认证中间件

use crate::error::AppError;
use crate::models::audit::{AuditActor, AuditDetails, AuditEventType};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// 公开密钥标识，例如 "ak_x9f2k1q0"
    pub api_key_id: String,
    pub user_id: Uuid,
}

// 实现 FromRequestParts 以便在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 从请求头提取明文密钥
/// 支持 "Authorization: Bearer lab_ak_..." 与 "X-Api-Key" 两种携带方式
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if token.starts_with("lab_ak_") {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// 可选 API Key 认证 - 不强制要求密钥
///
/// 携带了密钥但校验失败时返回 401 并记录审计事件；完全未携带密钥的请求
/// 继续放行，由各 handler 的 AuthContext 提取器决定是否拒绝。
pub async fn optional_api_key_middleware(
    State(state): State<Arc<crate::middleware::AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(secret) = extract_api_key(req.headers()) else {
        return Ok(next.run(req).await);
    };

    match state.api_key_service.validate_key(&secret).await {
        Ok(key) => {
            req.extensions_mut().insert(AuthContext {
                api_key_id: key.key_id,
                user_id: key.user_id,
            });
            Ok(next.run(req).await)
        }
        Err(AppError::Unauthorized) => {
            // 无效密钥是安全相关事件，写入审计轨迹（失败不阻断响应）
            let ip = crate::middleware::get_client_ip(req.headers(), state.config.security.trust_proxy);
            let details = AuditDetails::failure("invalid or revoked API key");
            if let Err(err) = state
                .audit_service
                .log_event(
                    AuditActor {
                        user_id: None,
                        ip_address: ip.as_deref(),
                        user_agent: None,
                    },
                    AuditEventType::ApiKeyAuthFailure,
                    details,
                )
                .await
            {
                tracing::warn!(error = %err, "Failed to audit API key auth failure");
            }

            Err(AppError::Unauthorized)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_api_key_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            "Bearer lab_ak_abcdefghijklmnopqrstuvwxyz123456".parse().unwrap(),
        );

        let key = extract_api_key(&headers).unwrap();
        assert!(key.starts_with("lab_ak_"));
    }

    #[test]
    fn test_extract_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "lab_ak_0123456789".parse().unwrap());

        assert_eq!(extract_api_key(&headers).unwrap(), "lab_ak_0123456789");
    }

    #[test]
    fn test_extract_api_key_missing() {
        let headers = HeaderMap::new();
        assert!(extract_api_key(&headers).is_none());
    }

    #[test]
    fn test_extract_api_key_ignores_non_key_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer some-jwt-token".parse().unwrap());

        assert!(extract_api_key(&headers).is_none());
    }
}
