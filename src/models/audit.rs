//! Audit domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    // 用户相关
    UserLogin,
    UserLogout,
    UserOnboard,

    // API Key 相关
    ApiKeyCreate,
    ApiKeyRevoke,
    ApiKeyAuthFailure,

    // 报告与数据相关
    ReportGenerate,
    ReportExport,
    DataExport,

    // 通知相关
    NotificationSend,

    // 安全相关
    RateLimitExceeded,
    AuditVerify,
    AuditExport,
    AuditIntegrityFailure,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::UserLogin => "user.login",
            AuditEventType::UserLogout => "user.logout",
            AuditEventType::UserOnboard => "user.onboard",

            AuditEventType::ApiKeyCreate => "api_key.create",
            AuditEventType::ApiKeyRevoke => "api_key.revoke",
            AuditEventType::ApiKeyAuthFailure => "api_key.auth_failure",

            AuditEventType::ReportGenerate => "report.generate",
            AuditEventType::ReportExport => "report.export",
            AuditEventType::DataExport => "data.export",

            AuditEventType::NotificationSend => "notification.send",

            AuditEventType::RateLimitExceeded => "rate_limit.exceeded",
            AuditEventType::AuditVerify => "audit.verify",
            AuditEventType::AuditExport => "audit.export",
            AuditEventType::AuditIntegrityFailure => "audit.integrity_failure",
        }
    }
}

/// Audit event row. Append-only: rows are never updated or deleted by the
/// application; any later mutation must be caught by chain verification.
///
/// The chain fields (`hash`, `sequence_number`-link, Merkle root) live inside
/// `metadata`; `signature`, `previous_hash` and `sequence_number` are also
/// first-class columns so the store can enforce the UNIQUE sequence
/// constraint and order scans without JSON extraction.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: serde_json::Value,
    pub signature: String,
    pub previous_hash: String,
    pub sequence_number: i64,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    /// 事件内容哈希（存放在 metadata 中）
    pub fn hash(&self) -> &str {
        self.metadata
            .get("hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// 自由格式明细（metadata.details）
    pub fn details(&self) -> Option<&serde_json::Value> {
        self.metadata.get("details")
    }
}

/// 事件主体描述（谁在操作）
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditActor<'a> {
    pub user_id: Option<Uuid>,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// 事件明细描述（操作了什么、结果如何）
#[derive(Debug, Clone, Default)]
pub struct AuditDetails<'a> {
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub success: bool,
    pub error_message: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
}

impl<'a> AuditDetails<'a> {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error_message: &'a str) -> Self {
        Self {
            success: false,
            error_message: Some(error_message),
            ..Default::default()
        }
    }
}

/// Audit event filters
#[derive(Debug, Default, Deserialize)]
pub struct AuditEventFilters {
    pub user_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub success: Option<bool>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// 链校验结果
///
/// "broken chain"（断链）与 "tampered event"（篡改）是两类结论：断链后
/// 扫描立即停止，之后的内容不可信；篡改事件仅被记录，扫描继续，以便一次
/// 枚举出所有被改动的事件。
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_chain_at: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tampered_events: Vec<String>,
}

impl VerificationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            broken_chain_at: None,
            tampered_events: Vec::new(),
        }
    }
}

/// 导出证明
#[derive(Debug, Clone, Serialize)]
pub struct ExportProof {
    pub merkle_root: String,
    pub chain_valid: bool,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// 带证明的审计导出
#[derive(Debug, Clone, Serialize)]
pub struct AuditExport {
    pub events: Vec<AuditEvent>,
    pub proof: ExportProof,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(AuditEventType::UserLogin.as_str(), "user.login");
        assert_eq!(AuditEventType::ApiKeyCreate.as_str(), "api_key.create");
        assert_eq!(AuditEventType::RateLimitExceeded.as_str(), "rate_limit.exceeded");
        assert_eq!(
            AuditEventType::AuditIntegrityFailure.as_str(),
            "audit.integrity_failure"
        );
    }

    #[test]
    fn test_event_type_names_are_dotted() {
        let all = [
            AuditEventType::UserLogin,
            AuditEventType::UserLogout,
            AuditEventType::UserOnboard,
            AuditEventType::ApiKeyCreate,
            AuditEventType::ApiKeyRevoke,
            AuditEventType::ApiKeyAuthFailure,
            AuditEventType::ReportGenerate,
            AuditEventType::ReportExport,
            AuditEventType::DataExport,
            AuditEventType::NotificationSend,
            AuditEventType::RateLimitExceeded,
            AuditEventType::AuditVerify,
            AuditEventType::AuditExport,
            AuditEventType::AuditIntegrityFailure,
        ];

        for event_type in all {
            assert!(event_type.as_str().contains('.'));
        }
    }

    #[test]
    fn test_details_constructors() {
        let ok = AuditDetails::success();
        assert!(ok.success);
        assert!(ok.error_message.is_none());

        let failed = AuditDetails::failure("instrument offline");
        assert!(!failed.success);
        assert_eq!(failed.error_message, Some("instrument offline"));
    }
}
