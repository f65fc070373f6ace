//! Audit repository (审计数据访问)
//! 审计事件表是 append-only 的：这里只有插入与读取，没有更新和删除

use crate::{error::AppError, models::audit::*};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

pub struct AuditRepository {
    db: PgPool,
}

impl AuditRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 插入审计事件
    /// sequence_number 上的 UNIQUE 约束会让并发写入者中的失败方收到
    /// 唯一键冲突，调用方据此重新同步游标后重试
    pub async fn insert_event(&self, event: &AuditEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, user_id, event_type, resource_type, resource_id, success,
                error_message, ip_address, user_agent, metadata, signature,
                previous_hash, sequence_number, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&event.id)
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(event.success)
        .bind(&event.error_message)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.metadata)
        .bind(&event.signature)
        .bind(&event.previous_hash)
        .bind(event.sequence_number)
        .bind(event.occurred_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 读取链尾事件（序号最大者），用于游标初始化
    pub async fn latest_event(&self) -> Result<Option<AuditEvent>, AppError> {
        let event = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events ORDER BY sequence_number DESC LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;

        Ok(event)
    }

    /// 按时间升序读取事件，可选时间范围
    /// 链校验依赖这一顺序
    pub async fn fetch_range(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, AppError> {
        let mut query = String::from("SELECT * FROM audit_events WHERE 1=1");
        let mut index = 0;

        if start_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at >= ${}", index));
        }
        if end_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at <= ${}", index));
        }

        query.push_str(" ORDER BY occurred_at ASC, sequence_number ASC");

        let mut query_builder = sqlx::query_as::<_, AuditEvent>(&query);

        if let Some(start_time) = start_time {
            query_builder = query_builder.bind(start_time);
        }
        if let Some(end_time) = end_time {
            query_builder = query_builder.bind(end_time);
        }

        let events = query_builder.fetch_all(&self.db).await?;
        Ok(events)
    }

    /// 条件查询审计事件（管理界面使用，倒序分页）
    pub async fn query_events(
        &self,
        filters: &AuditEventFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AppError> {
        let mut query = String::from("SELECT * FROM audit_events WHERE 1=1");
        let mut index = 0;

        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.event_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND event_type = ${}", index));
        }
        if filters.resource_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND resource_type = ${}", index));
        }
        if filters.resource_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND resource_id = ${}", index));
        }
        if filters.success.is_some() {
            index += 1;
            query.push_str(&format!(" AND success = ${}", index));
        }
        if filters.start_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at >= ${}", index));
        }
        if filters.end_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at <= ${}", index));
        }

        query.push_str(&format!(
            " ORDER BY occurred_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, AuditEvent>(&query);

        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(event_type) = &filters.event_type {
            query_builder = query_builder.bind(event_type);
        }
        if let Some(resource_type) = &filters.resource_type {
            query_builder = query_builder.bind(resource_type);
        }
        if let Some(resource_id) = &filters.resource_id {
            query_builder = query_builder.bind(resource_id);
        }
        if let Some(success) = filters.success {
            query_builder = query_builder.bind(success);
        }
        if let Some(start_time) = filters.start_time {
            query_builder = query_builder.bind(start_time);
        }
        if let Some(end_time) = filters.end_time {
            query_builder = query_builder.bind(end_time);
        }

        let events = query_builder
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(events)
    }

    /// 统计审计事件数量
    pub async fn count_events(&self, filters: &AuditEventFilters) -> Result<i64, AppError> {
        let mut query = String::from("SELECT COUNT(*) FROM audit_events WHERE 1=1");
        let mut index = 0;

        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.event_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND event_type = ${}", index));
        }
        if filters.resource_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND resource_type = ${}", index));
        }
        if filters.resource_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND resource_id = ${}", index));
        }
        if filters.success.is_some() {
            index += 1;
            query.push_str(&format!(" AND success = ${}", index));
        }
        if filters.start_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at >= ${}", index));
        }
        if filters.end_time.is_some() {
            index += 1;
            query.push_str(&format!(" AND occurred_at <= ${}", index));
        }

        let mut query_builder = sqlx::query(&query);

        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(event_type) = &filters.event_type {
            query_builder = query_builder.bind(event_type);
        }
        if let Some(resource_type) = &filters.resource_type {
            query_builder = query_builder.bind(resource_type);
        }
        if let Some(resource_id) = &filters.resource_id {
            query_builder = query_builder.bind(resource_id);
        }
        if let Some(success) = filters.success {
            query_builder = query_builder.bind(success);
        }
        if let Some(start_time) = filters.start_time {
            query_builder = query_builder.bind(start_time);
        }
        if let Some(end_time) = filters.end_time {
            query_builder = query_builder.bind(end_time);
        }

        let count: i64 = query_builder.fetch_one(&self.db).await?.get(0);
        Ok(count)
    }
}

/// 判断插入失败是否由唯一键冲突引起（PostgreSQL unique_violation）
pub fn is_sequence_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
