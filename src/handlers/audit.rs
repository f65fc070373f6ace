//! 审计日志的 HTTP 处理器

use crate::{
    auth::middleware::AuthContext, error::AppError, middleware::AppState, models::audit::*,
};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AuditEventQuery {
    pub user_id: Option<uuid::Uuid>,
    pub event_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub success: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct VerifyChainRequest {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// 查询审计事件
pub async fn list_audit_events(
    State(state): State<Arc<AppState>>,
    _auth_context: AuthContext,
    Query(query): Query<AuditEventQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = AuditEventFilters {
        user_id: query.user_id,
        event_type: query.event_type,
        resource_type: query.resource_type,
        resource_id: query.resource_id,
        success: query.success,
        start_time: query.start_time,
        end_time: query.end_time,
    };

    let events = state
        .audit_service
        .query_events(&filters, query.limit, query.offset)
        .await?;
    let total = state.audit_service.count_events(&filters).await?;

    Ok(Json(json!({
        "events": events,
        "count": events.len(),
        "total": total
    })))
}

/// 链完整性校验
pub async fn verify_chain(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(request): Json<VerifyChainRequest>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .audit_service
        .verify_chain(request.start_time, request.end_time)
        .await?;

    // 校验本身也是审计事件（失败不影响返回）
    let details = AuditDetails {
        resource_type: Some("audit_chain"),
        success: result.valid,
        error_message: (!result.valid).then_some("chain verification failed"),
        ..Default::default()
    };
    if let Err(err) = state
        .audit_service
        .log_event(
            AuditActor {
                user_id: Some(auth_context.user_id),
                ..Default::default()
            },
            AuditEventType::AuditVerify,
            details,
        )
        .await
    {
        tracing::warn!(error = %err, "Failed to audit chain verification");
    }

    Ok(Json(result))
}

/// 带证明导出
pub async fn export_with_proof(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(request): Json<ExportRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.end_time < request.start_time {
        return Err(AppError::BadRequest(
            "end_time must not be before start_time".to_string(),
        ));
    }

    let export = state
        .audit_service
        .export_with_proof(request.start_time, request.end_time)
        .await?;

    let details = AuditDetails {
        resource_type: Some("audit_chain"),
        success: true,
        metadata: Some(json!({
            "merkle_root": export.proof.merkle_root,
            "event_count": export.events.len(),
        })),
        ..Default::default()
    };
    if let Err(err) = state
        .audit_service
        .log_event(
            AuditActor {
                user_id: Some(auth_context.user_id),
                ..Default::default()
            },
            AuditEventType::AuditExport,
            details,
        )
        .await
    {
        tracing::warn!(error = %err, "Failed to audit export");
    }

    Ok(Json(export))
}
