//! API Key repository (密钥数据访问)

use crate::{error::AppError, models::api_key::ApiKey};
use sqlx::PgPool;
use uuid::Uuid;

pub struct ApiKeyRepository {
    db: PgPool,
}

impl ApiKeyRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 插入新密钥记录
    pub async fn insert(&self, key: &ApiKey) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (id, key_id, key_hash, user_id, name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(key.id)
        .bind(&key.key_id)
        .bind(&key.key_hash)
        .bind(key.user_id)
        .bind(&key.name)
        .bind(key.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 按用户列出密钥
    pub async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<ApiKey>, AppError> {
        let keys = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(keys)
    }

    /// 按哈希查找未吊销的密钥（认证路径）
    pub async fn find_active_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, AppError> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE key_hash = $1 AND revoked_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.db)
        .await?;

        Ok(key)
    }

    /// 吊销密钥；已吊销的保持原吊销时间不变
    pub async fn revoke(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 更新最近使用时间（尽力而为，失败不影响认证结果）
    pub async fn touch_last_used(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}
