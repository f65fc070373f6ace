//! 周期维护任务
//! 限流窗口清理、行为画像清扫、审计链完整性巡检
//!
//! 三个任务彼此独立，也不持有任何会阻塞请求路径写入的锁。

use crate::middleware::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// 启动所有维护任务，返回句柄供优雅关闭时取消
pub fn spawn_maintenance_tasks(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    // 过期限流窗口清理
    {
        let state = state.clone();
        let period = Duration::from_secs(state.config.rate_limit.gc_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(err) = state.rate_limit_service.collect_garbage().await {
                    tracing::warn!(error = %err, "Rate limit window GC failed");
                }
            }
        }));
    }

    // 空闲行为画像清扫
    {
        let state = state.clone();
        let period = Duration::from_secs(state.config.rate_limit.profile_sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                state.rate_limit_service.sweep_profiles().await;
            }
        }));
    }

    // 审计链完整性巡检
    {
        let state = state.clone();
        let period = Duration::from_secs(state.config.audit.integrity_check_interval_secs);
        handles.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(err) = state.audit_service.run_integrity_check().await {
                    tracing::warn!(error = %err, "Audit integrity check could not run");
                }
            }
        }));
    }

    tracing::info!(tasks = handles.len(), "Maintenance tasks started");
    handles
}
