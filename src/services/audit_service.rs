//! 防篡改审计日志服务
//!
//! 在普通审计日志之上维护一条哈希链：每个事件携带前一事件的哈希、严格
//! 递增的序号和 HMAC 签名。事后修改或删除任何一条记录都会被链校验发现。
//!
//! 进程内游标（下一个序号 + 链尾哈希）由异步互斥锁保护，首次使用时从
//! 存储中的链尾惰性初始化。多进程部署下 sequence_number 的 UNIQUE 约束
//! 兜底：竞争失败方收到唯一键冲突，重新同步游标后重试一次。

use crate::audit::chain::{self, EventContent, GENESIS_HASH};
use crate::error::AppError;
use crate::models::audit::*;
use crate::repository::audit_repo::{self, AuditRepository};
use crate::services::alert_service::{AlertService, AlertSeverity};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use secrecy::{ExposeSecret, Secret};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;

/// 链游标：下一个待分配序号与链尾哈希
struct ChainCursor {
    initialized: bool,
    sequence_number: i64,
    previous_hash: String,
}

pub struct AuditService {
    db: PgPool,
    signing_key: Secret<String>,
    alert_service: Arc<AlertService>,
    cursor: Mutex<ChainCursor>,
}

impl AuditService {
    pub fn new(db: PgPool, signing_key: Secret<String>, alert_service: Arc<AlertService>) -> Self {
        Self {
            db,
            signing_key,
            alert_service,
            // 游标延迟到首次 log_event 时初始化，避免启动阶段配置未就绪时失败
            cursor: Mutex::new(ChainCursor {
                initialized: false,
                sequence_number: 0,
                previous_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    fn signing_key_bytes(&self) -> &[u8] {
        self.signing_key.expose_secret().as_bytes()
    }

    /// 追加一条审计事件并延长哈希链
    ///
    /// 持久化失败时游标不前进，重试会复用同一 (previous_hash, sequence)
    /// 链接，不会在链上留下空洞。调用方应把审计失败当作对主操作非致命的
    /// 错误处理（记日志后继续）。
    pub async fn log_event(
        &self,
        actor: AuditActor<'_>,
        event_type: AuditEventType,
        details: AuditDetails<'_>,
    ) -> Result<AuditEvent, AppError> {
        let repo = AuditRepository::new(self.db.clone());
        let mut cursor = self.cursor.lock().await;

        if !cursor.initialized {
            Self::resync_cursor(&repo, &mut cursor).await?;
            cursor.initialized = true;
        }

        match Self::append_once(&repo, &mut cursor, self.signing_key_bytes(), &actor, event_type, &details)
            .await
        {
            Ok(event) => Ok(event),
            Err(err) if audit_repo::is_sequence_conflict(&err) => {
                // 另一个写入者抢先占用了该序号：同步到新链尾后重试一次
                tracing::warn!(
                    sequence_number = cursor.sequence_number,
                    "Audit sequence conflict, resyncing cursor and retrying"
                );
                metrics::counter!("audit.sequence_conflicts").increment(1);

                Self::resync_cursor(&repo, &mut cursor).await?;
                Self::append_once(&repo, &mut cursor, self.signing_key_bytes(), &actor, event_type, &details)
                    .await
                    .map_err(AppError::from)
            }
            Err(err) => Err(AppError::from(err)),
        }
    }

    /// 校验链完整性，可选时间范围
    ///
    /// 校验失败不是错误：结果区分"断链"（立即停止，之后内容不可信）与
    /// "篡改事件"（继续扫描以枚举全部篡改），见 [`VerificationResult`]。
    pub async fn verify_chain(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<VerificationResult, AppError> {
        let repo = AuditRepository::new(self.db.clone());
        let events = repo.fetch_range(start_time, end_time).await?;

        let result = chain::verify_events(&events, self.signing_key_bytes());

        metrics::counter!("audit.verifications").increment(1);
        if !result.valid {
            metrics::counter!("audit.verification_failures").increment(1);
            tracing::warn!(
                errors = result.errors.len(),
                broken_chain_at = ?result.broken_chain_at,
                tampered = result.tampered_events.len(),
                "Audit chain verification failed"
            );
        }

        Ok(result)
    }

    /// 带证明导出：事件 + {Merkle 根, 链校验结论, HMAC 签名, 时间戳}
    ///
    /// 持有签名密钥的消费方可独立复算 Merkle 根与签名，确认导出内容
    /// 在生成后未被改动。
    pub async fn export_with_proof(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<AuditExport, AppError> {
        let repo = AuditRepository::new(self.db.clone());
        let events = repo.fetch_range(Some(start_time), Some(end_time)).await?;

        let verification = chain::verify_events(&events, self.signing_key_bytes());

        let hashes: Vec<String> = events.iter().map(|e| e.hash().to_string()).collect();
        let merkle_root = chain::merkle_root(&hashes);

        let signature = chain::sign_export(
            self.signing_key_bytes(),
            &merkle_root,
            start_time.timestamp_millis(),
            end_time.timestamp_millis(),
        );

        metrics::counter!("audit.exports").increment(1);

        Ok(AuditExport {
            events,
            proof: ExportProof {
                merkle_root,
                chain_valid: verification.valid,
                signature,
                timestamp: Utc::now(),
            },
        })
    }

    /// 全链完整性巡检（周期任务调用）
    ///
    /// 断链意味着不可逆的审计篡改，需要人工立即介入，因此走最高告警级别。
    pub async fn run_integrity_check(&self) -> Result<VerificationResult, AppError> {
        let result = self.verify_chain(None, None).await?;

        if !result.valid {
            self.alert_service.notify(
                AlertSeverity::Critical,
                "audit chain integrity check failed",
                &format!(
                    "errors={} broken_chain_at={:?} tampered_events={:?}",
                    result.errors.len(),
                    result.broken_chain_at,
                    result.tampered_events
                ),
            );

            // 把检测结论本身写入审计轨迹
            let detail = format!(
                "integrity check found {} error(s), broken_chain_at={:?}",
                result.errors.len(),
                result.broken_chain_at
            );
            if let Err(err) = self
                .log_event(
                    AuditActor::default(),
                    AuditEventType::AuditIntegrityFailure,
                    AuditDetails::failure(&detail),
                )
                .await
            {
                tracing::error!(error = %err, "Failed to record integrity failure event");
            }
        } else {
            tracing::info!("Audit chain integrity check passed");
        }

        Ok(result)
    }

    /// 条件查询审计事件
    pub async fn query_events(
        &self,
        filters: &AuditEventFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEvent>, AppError> {
        let repo = AuditRepository::new(self.db.clone());
        repo.query_events(filters, limit, offset).await
    }

    /// 查询审计事件数量
    pub async fn count_events(&self, filters: &AuditEventFilters) -> Result<i64, AppError> {
        let repo = AuditRepository::new(self.db.clone());
        repo.count_events(filters).await
    }

    /// 构造、签名并持久化一条事件；成功后推进游标
    async fn append_once(
        repo: &AuditRepository,
        cursor: &mut ChainCursor,
        signing_key: &[u8],
        actor: &AuditActor<'_>,
        event_type: AuditEventType,
        details: &AuditDetails<'_>,
    ) -> Result<AuditEvent, sqlx::Error> {
        // 时间戳截断到毫秒：哈希载荷中的 timestamp_ms 必须在回读后可精确复算
        let now_ms = Utc::now().timestamp_millis();
        let occurred_at = DateTime::<Utc>::from_timestamp_millis(now_ms).unwrap_or_else(Utc::now);

        let id = generate_event_id(now_ms);

        let hash = chain::content_hash(&EventContent {
            id: &id,
            timestamp_ms: now_ms,
            user_id: actor.user_id,
            event_type: event_type.as_str(),
            resource_type: details.resource_type,
            resource_id: details.resource_id,
            success: details.success,
            error_message: details.error_message,
            details: details.metadata.as_ref(),
            previous_hash: &cursor.previous_hash,
            sequence_number: cursor.sequence_number,
        });

        let signature = chain::sign_hash(signing_key, &hash);

        let metadata = serde_json::json!({
            "hash": hash,
            "previous_hash": cursor.previous_hash,
            "sequence_number": cursor.sequence_number,
            "signature": signature,
            "details": details.metadata.clone().unwrap_or(serde_json::Value::Null),
        });

        let event = AuditEvent {
            id,
            user_id: actor.user_id,
            event_type: event_type.as_str().to_string(),
            resource_type: details.resource_type.map(str::to_string),
            resource_id: details.resource_id.map(str::to_string),
            success: details.success,
            error_message: details.error_message.map(str::to_string),
            ip_address: actor.ip_address.map(str::to_string),
            user_agent: actor.user_agent.map(str::to_string),
            metadata,
            signature,
            previous_hash: cursor.previous_hash.clone(),
            sequence_number: cursor.sequence_number,
            occurred_at,
        };

        repo.insert_event(&event).await?;

        // 只有持久化成功才推进游标
        cursor.previous_hash = event.hash().to_string();
        cursor.sequence_number += 1;

        metrics::counter!("audit.events_logged", "event_type" => event_type.as_str())
            .increment(1);
        tracing::debug!(
            event_id = %event.id,
            event_type = event_type.as_str(),
            sequence_number = event.sequence_number,
            "Audit event logged"
        );

        Ok(event)
    }

    /// 从存储链尾重建游标
    async fn resync_cursor(
        repo: &AuditRepository,
        cursor: &mut ChainCursor,
    ) -> Result<(), AppError> {
        match repo.latest_event().await? {
            Some(event) => {
                cursor.sequence_number = event.sequence_number + 1;
                cursor.previous_hash = event.hash().to_string();
            }
            None => {
                cursor.sequence_number = 0;
                cursor.previous_hash = GENESIS_HASH.to_string();
            }
        }
        Ok(())
    }
}

/// 事件 ID：时间戳 + 随机后缀
fn generate_event_id(timestamp_ms: i64) -> String {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();

    format!("evt_{}_{}", timestamp_ms, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_event_id_shape() {
        let id = generate_event_id(1_700_000_000_000);
        assert!(id.starts_with("evt_1700000000000_"));
        assert_eq!(id.len(), "evt_1700000000000_".len() + 8);
    }

    #[test]
    fn test_generate_event_id_unique_suffix() {
        let a = generate_event_id(1_700_000_000_000);
        let b = generate_event_id(1_700_000_000_000);
        // 8 位字母数字后缀，同毫秒内碰撞概率可忽略
        assert_ne!(a, b);
    }
}
