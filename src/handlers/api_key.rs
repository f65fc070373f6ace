//! API Key 管理处理器

use crate::{
    auth::middleware::AuthContext,
    error::AppError,
    middleware::AppState,
    models::api_key::CreateApiKeyRequest,
    models::audit::{AuditActor, AuditDetails, AuditEventType},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// 创建 API Key
/// 明文密钥只在本次响应中返回一次
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = request.user_id;
    let created = state.api_key_service.create_key(request).await?;

    let details = AuditDetails {
        resource_type: Some("api_key"),
        resource_id: Some(&created.key_id),
        success: true,
        ..Default::default()
    };
    if let Err(err) = state
        .audit_service
        .log_event(
            AuditActor {
                user_id: Some(user_id),
                ..Default::default()
            },
            AuditEventType::ApiKeyCreate,
            details,
        )
        .await
    {
        tracing::warn!(error = %err, "Failed to audit API key creation");
    }

    Ok((StatusCode::CREATED, Json(created)))
}

/// 列出当前调用者的 API Key
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
) -> Result<impl IntoResponse, AppError> {
    let keys = state.api_key_service.list_keys(auth_context.user_id).await?;

    Ok(Json(json!({
        "keys": keys,
        "count": keys.len()
    })))
}

/// 吊销 API Key
pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    // 只能吊销属于自己的密钥
    let owned = state
        .api_key_service
        .list_keys(auth_context.user_id)
        .await?
        .iter()
        .any(|k| k.id == id);
    if !owned {
        return Err(AppError::NotFound);
    }

    state.api_key_service.revoke_key(id).await?;

    let id_str = id.to_string();
    let details = AuditDetails {
        resource_type: Some("api_key"),
        resource_id: Some(&id_str),
        success: true,
        ..Default::default()
    };
    if let Err(err) = state
        .audit_service
        .log_event(
            AuditActor {
                user_id: Some(auth_context.user_id),
                ..Default::default()
            },
            AuditEventType::ApiKeyRevoke,
            details,
        )
        .await
    {
        tracing::warn!(error = %err, "Failed to audit API key revocation");
    }

    Ok(StatusCode::NO_CONTENT)
}
