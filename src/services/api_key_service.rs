//! API Key 管理服务

use crate::auth::api_key::ApiKeyGenerator;
use crate::error::AppError;
use crate::models::api_key::{ApiKey, CreateApiKeyRequest, CreatedApiKeyResponse};
use crate::repository::api_key_repo::ApiKeyRepository;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

pub struct ApiKeyService {
    db: PgPool,
}

impl ApiKeyService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 创建新密钥
    /// 明文密钥只出现在返回值中，存储层只保留 SHA-256 哈希
    pub async fn create_key(
        &self,
        request: CreateApiKeyRequest,
    ) -> Result<CreatedApiKeyResponse, AppError> {
        request.validate()?;

        let secret = ApiKeyGenerator::generate();
        let key = ApiKey {
            id: Uuid::new_v4(),
            key_id: ApiKeyGenerator::generate_key_id(&secret),
            key_hash: ApiKeyGenerator::hash(&secret),
            user_id: request.user_id,
            name: request.name,
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
        };

        let repo = ApiKeyRepository::new(self.db.clone());
        repo.insert(&key).await?;

        tracing::info!(key_id = %key.key_id, user_id = %key.user_id, "API key created");
        metrics::counter!("api_keys.created").increment(1);

        Ok(CreatedApiKeyResponse {
            id: key.id,
            key_id: key.key_id,
            name: key.name,
            key: secret,
            created_at: key.created_at,
        })
    }

    /// 按用户列出密钥（不含哈希）
    pub async fn list_keys(&self, user_id: Uuid) -> Result<Vec<ApiKey>, AppError> {
        let repo = ApiKeyRepository::new(self.db.clone());
        repo.list_by_user(user_id).await
    }

    /// 吊销密钥
    pub async fn revoke_key(&self, id: Uuid) -> Result<(), AppError> {
        let repo = ApiKeyRepository::new(self.db.clone());
        let revoked = repo.revoke(id).await?;

        if !revoked {
            return Err(AppError::NotFound);
        }

        tracing::info!(id = %id, "API key revoked");
        metrics::counter!("api_keys.revoked").increment(1);
        Ok(())
    }

    /// 校验明文密钥，返回匹配的未吊销记录
    /// 同时尽力刷新 last_used_at（刷新失败不影响认证结果）
    pub async fn validate_key(&self, secret: &str) -> Result<ApiKey, AppError> {
        let repo = ApiKeyRepository::new(self.db.clone());
        let key = repo
            .find_active_by_hash(&ApiKeyGenerator::hash(secret))
            .await?
            .ok_or(AppError::Unauthorized)?;

        if let Err(err) = repo.touch_last_used(key.id).await {
            tracing::debug!(key_id = %key.key_id, error = %err, "Failed to stamp last_used_at");
        }

        Ok(key)
    }
}
