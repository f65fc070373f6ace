//! Rate limit repository (限流计数数据访问)

use crate::models::rate_limit::RateLimitWindow;
use sqlx::{PgPool, Row};

pub struct RateLimitRepository {
    db: PgPool,
}

impl RateLimitRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 原子地对 (key_id, window_start) 计数加一，返回加一后的计数
    ///
    /// 不存在则以 count=1 创建。整个 upsert 是单条语句，由数据库保证
    /// 并发调用者不会丢失增量，也不会读到撕裂的计数。
    pub async fn increment(&self, key_id: &str, window_start: i64) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (key_id, window_start, request_count)
            VALUES ($1, $2, 1)
            ON CONFLICT (key_id, window_start)
            DO UPDATE SET request_count = rate_limit_windows.request_count + 1
            RETURNING request_count
            "#,
        )
        .bind(key_id)
        .bind(window_start)
        .fetch_one(&self.db)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    /// 读取窗口记录（监控与测试用，不消耗配额）
    pub async fn fetch_window(
        &self,
        key_id: &str,
        window_start: i64,
    ) -> Result<Option<RateLimitWindow>, sqlx::Error> {
        let window = sqlx::query_as::<_, RateLimitWindow>(
            "SELECT * FROM rate_limit_windows WHERE key_id = $1 AND window_start = $2",
        )
        .bind(key_id)
        .bind(window_start)
        .fetch_optional(&self.db)
        .await?;

        Ok(window)
    }

    /// 清理过期窗口，返回删除行数
    /// 窗口开始时间早于 cutoff（毫秒时间戳）的记录不再参与任何判定
    pub async fn delete_expired(&self, cutoff_ms: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM rate_limit_windows WHERE window_start < $1")
            .bind(cutoff_ms)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
