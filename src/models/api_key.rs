//! API Key 领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// API Key 记录（只存哈希，不存明文）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    /// 公开标识，例如 "ak_x9f2k1q0"
    pub key_id: String,
    /// 明文密钥的 SHA-256 哈希
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// 创建 API Key 请求
#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,
    pub user_id: Uuid,
}

/// 创建响应：明文密钥只在创建时返回一次
#[derive(Debug, Serialize)]
pub struct CreatedApiKeyResponse {
    pub id: Uuid,
    pub key_id: String,
    pub name: String,
    /// 明文密钥，仅本次响应可见
    pub key: String,
    pub created_at: DateTime<Utc>,
}
