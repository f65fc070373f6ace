//! 多层限流服务
//!
//! 固定窗口计数存放在数据库中，单条 upsert 语句保证并发下的原子加一。
//! 在基础配额之上有两类调节：
//!   - 自适应：按系统负载把配额乘以 {1.2, 1.0, 0.7, 0.4, 0.1} 之一；
//!   - 行为：按用户信誉/错误率/可疑标记组合出 [0.1, 2.0] 内的乘数。
//!
//! 存储故障不向调用方抛错，而是按 fail-open/fail-closed 策略直接给出
//! 放行或拒绝结论：只有显式开关打开且非生产环境才放行，生产环境的
//! 数据库故障绝不会变成无限请求的口子。

use crate::config::RateLimitConfig;
use crate::models::rate_limit::*;
use crate::repository::rate_limit_repo::RateLimitRepository;
use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// 行为画像的回收阈值：超过 24 小时无活动即清除
const PROFILE_IDLE_SECS: i64 = 24 * 3600;

/// 更新画像时触发概率清扫的概率
const SWEEP_PROBABILITY: f64 = 0.01;

/// 错误率指数滑动平均的单次观测权重
const ERROR_RATE_EMA_WEIGHT: f64 = 0.1;

/// 计算窗口边界：窗口起点（毫秒，按窗口长度向下取整）与重置时间
pub fn window_bounds(now_ms: i64, window_ms: i64) -> (i64, i64) {
    let window_start = now_ms - now_ms.rem_euclid(window_ms);
    (window_start, window_start + window_ms)
}

/// 由加一后的计数得出放行结论与剩余额度
pub fn decision(count: i64, limit: u32) -> (bool, u32) {
    let allowed = count <= i64::from(limit);
    let remaining = (i64::from(limit) - count).max(0) as u32;
    (allowed, remaining)
}

/// 系统负载到配额乘数的映射
/// 负载跨过 {0.3, 0.6, 0.8, 0.95} 时乘数依次降档
pub fn adaptive_multiplier(load: f64) -> f64 {
    if load < 0.3 {
        1.2
    } else if load < 0.6 {
        1.0
    } else if load < 0.8 {
        0.7
    } else if load < 0.95 {
        0.4
    } else {
        0.1
    }
}

/// 行为乘数：信誉、错误率、可疑标记逐项相乘，结果钳制在 [0.1, 2.0]
pub fn behavior_multiplier(profile: &UserBehaviorProfile) -> f64 {
    let mut multiplier: f64 = if profile.reputation >= 80.0 {
        1.5
    } else if profile.reputation >= 60.0 {
        1.2
    } else if profile.reputation < 30.0 {
        0.5
    } else {
        1.0
    };

    if profile.error_rate > 0.5 {
        multiplier *= 0.3;
    } else if profile.error_rate > 0.2 {
        multiplier *= 0.7;
    }

    if profile.suspicious_activity {
        multiplier *= 0.2;
    }

    multiplier.clamp(0.1, 2.0)
}

/// 生效上限 = floor(基础配额 × 自适应乘数 × 行为乘数)，至少为 1
pub fn effective_limit(base: u32, adaptive: f64, behavioral: f64) -> u32 {
    ((f64::from(base) * adaptive * behavioral).floor() as u32).max(1)
}

/// 多层结果中挑出最严格者：
/// 有拒绝则返回首个拒绝；全部放行则返回剩余额度最小者
pub fn most_restrictive(checks: Vec<RateLimitCheck>) -> Option<RateLimitCheck> {
    if let Some(denied) = checks.iter().find(|c| !c.allowed) {
        return Some(denied.clone());
    }
    checks.into_iter().min_by_key(|c| c.remaining)
}

/// 系统负载跟踪器（外部采样写入，这里只保存最近值）
pub struct SystemLoadTracker {
    load_bits: AtomicU64,
}

impl Default for SystemLoadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLoadTracker {
    pub fn new() -> Self {
        Self {
            load_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn set_load(&self, load: f64) {
        let clamped = load.clamp(0.0, 1.0);
        self.load_bits.store(clamped.to_bits(), Ordering::Relaxed);
        metrics::gauge!("rate_limit.system_load").set(clamped);
    }

    pub fn current_load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }
}

/// 用户行为画像跟踪器（进程内）
#[derive(Default)]
pub struct BehaviorTracker {
    profiles: Mutex<HashMap<Uuid, UserBehaviorProfile>>,
}

impl BehaviorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次请求结果并更新画像
    ///
    /// 信誉：成功且不可疑 +0.1（上限 100），失败 −1（下限 0），
    /// 可疑行为额外 −10 并永久置位 suspicious_activity。
    /// 错误率按权重 0.1 做指数滑动平均。
    pub async fn record_request(&self, user_id: Uuid, success: bool, suspicious: bool) {
        let now = Utc::now();
        let mut profiles = self.profiles.lock().await;

        let profile = profiles
            .entry(user_id)
            .or_insert_with(|| UserBehaviorProfile::new(now));

        profile.request_count += 1;
        profile.last_activity = now;

        let observation = if success { 0.0 } else { 1.0 };
        profile.error_rate = (profile.error_rate * (1.0 - ERROR_RATE_EMA_WEIGHT)
            + observation * ERROR_RATE_EMA_WEIGHT)
            .clamp(0.0, 1.0);

        if suspicious {
            profile.suspicious_activity = true;
            profile.reputation = (profile.reputation - 10.0).max(0.0);
        }

        if success && !suspicious {
            profile.reputation = (profile.reputation + 0.1).min(100.0);
        } else if !success {
            profile.reputation = (profile.reputation - 1.0).max(0.0);
        }

        // 概率清扫：避免长时间运行下画像无限增长
        let roll: f64 = rand::thread_rng().gen();
        if roll < SWEEP_PROBABILITY {
            Self::sweep_locked(&mut profiles, now.timestamp());
        }
    }

    /// 当前行为乘数；没有画像的用户按 1.0 处理
    pub async fn multiplier_for(&self, user_id: Uuid) -> f64 {
        let profiles = self.profiles.lock().await;
        profiles
            .get(&user_id)
            .map(behavior_multiplier)
            .unwrap_or(1.0)
    }

    /// 清扫空闲画像，返回清除数量
    pub async fn sweep_idle(&self) -> usize {
        let mut profiles = self.profiles.lock().await;
        Self::sweep_locked(&mut profiles, Utc::now().timestamp())
    }

    fn sweep_locked(profiles: &mut HashMap<Uuid, UserBehaviorProfile>, now_secs: i64) -> usize {
        let before = profiles.len();
        profiles.retain(|_, p| now_secs - p.last_activity.timestamp() <= PROFILE_IDLE_SECS);
        before - profiles.len()
    }

    #[cfg(test)]
    pub async fn profile(&self, user_id: Uuid) -> Option<UserBehaviorProfile> {
        self.profiles.lock().await.get(&user_id).cloned()
    }
}

pub struct RateLimitService {
    db: PgPool,
    config: RateLimitConfig,
    /// fail-open 的两个条件（开关 + 非生产环境）在构造时折算完毕
    fail_open_allowed: bool,
    behavior: BehaviorTracker,
    load: SystemLoadTracker,
}

impl RateLimitService {
    pub fn new(db: PgPool, config: RateLimitConfig, is_production: bool) -> Self {
        let fail_open_allowed = config.fail_open && !is_production;
        if fail_open_allowed {
            tracing::warn!("Rate limiter configured fail-open (non-production only)");
        }

        Self {
            db,
            config,
            fail_open_allowed,
            behavior: BehaviorTracker::new(),
            load: SystemLoadTracker::new(),
        }
    }

    pub fn load_tracker(&self) -> &SystemLoadTracker {
        &self.load
    }

    pub fn behavior_tracker(&self) -> &BehaviorTracker {
        &self.behavior
    }

    /// 检查并消耗一个窗口配额
    ///
    /// 计数通过单条原子 upsert 完成：并发调用者不会丢失增量，也不会
    /// 出现两个调用者同时读到 limit-1 后双双放行的情况。
    pub async fn check_and_consume(
        &self,
        key_id: &str,
        limit: u32,
        window_ms: i64,
    ) -> RateLimitCheck {
        let now_ms = Utc::now().timestamp_millis();
        let (window_start, reset_at) = window_bounds(now_ms, window_ms);

        let repo = RateLimitRepository::new(self.db.clone());
        match repo.increment(key_id, window_start).await {
            Ok(count) => {
                let (allowed, remaining) = decision(count, limit);

                if !allowed {
                    metrics::counter!("rate_limit.denied").increment(1);
                    tracing::debug!(
                        key_id = key_id,
                        count = count,
                        limit = limit,
                        "Rate limit exceeded"
                    );
                }

                RateLimitCheck {
                    key_id: key_id.to_string(),
                    allowed,
                    remaining,
                    reset_at,
                    limit,
                }
            }
            Err(err) => self.storage_failure_decision(key_id, limit, reset_at, &err),
        }
    }

    /// 多层检查：对每个给出的维度独立消耗配额，返回最严格的结论
    ///
    /// 消耗策略由配置决定：`ConsumeAll` 在某一维度拒绝后仍消耗其余维度
    /// （保留原始行为）；`StopOnDenial` 在首个拒绝后停止消耗。
    pub async fn check_multi_layer(&self, params: MultiLayerParams) -> RateLimitCheck {
        let window_ms = params.window_ms.unwrap_or(self.config.window_ms);
        let adaptive = adaptive_multiplier(self.load.current_load());

        // (维度键, 生效上限)
        let mut dimensions: Vec<(String, u32)> = Vec::new();

        if let Some(api_key_id) = &params.api_key_id {
            let base = params.api_key_limit.unwrap_or(self.config.api_key_limit);
            dimensions.push((
                format!("apiKey:{}", api_key_id),
                effective_limit(base, adaptive, 1.0),
            ));
        }

        if let Some(user_id) = params.user_id {
            let base = params.user_limit.unwrap_or(self.config.user_limit);
            let behavioral = self.behavior.multiplier_for(user_id).await;
            dimensions.push((
                format!("user:{}", user_id),
                effective_limit(base, adaptive, behavioral),
            ));
        }

        if let Some(ip_address) = &params.ip_address {
            let base = params.ip_limit.unwrap_or(self.config.ip_limit);
            dimensions.push((
                format!("ip:{}", ip_address),
                effective_limit(base, adaptive, 1.0),
            ));
        }

        let mut checks = Vec::with_capacity(dimensions.len());
        for (key_id, limit) in dimensions {
            let check = self.check_and_consume(&key_id, limit, window_ms).await;
            let denied = !check.allowed;
            checks.push(check);

            if denied && self.config.consumption_policy == ConsumptionPolicy::StopOnDenial {
                break;
            }
        }

        most_restrictive(checks).unwrap_or_else(|| {
            // 没有任何维度可检查：无法限流，直接放行
            let (_, reset_at) = window_bounds(Utc::now().timestamp_millis(), window_ms);
            RateLimitCheck {
                key_id: "none".to_string(),
                allowed: true,
                remaining: u32::MAX,
                reset_at,
                limit: u32::MAX,
            }
        })
    }

    /// 请求结束后回写行为画像
    pub async fn record_outcome(&self, user_id: Uuid, success: bool, suspicious: bool) {
        self.behavior.record_request(user_id, success, suspicious).await;
    }

    /// 清理过期窗口（周期任务调用）
    /// 早于两个窗口长度之前的记录不会再被任何判定读取
    pub async fn collect_garbage(&self) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now().timestamp_millis() - 2 * self.config.window_ms;
        let repo = RateLimitRepository::new(self.db.clone());
        let deleted = repo.delete_expired(cutoff).await?;

        if deleted > 0 {
            tracing::debug!(deleted = deleted, "Expired rate limit windows removed");
        }
        metrics::counter!("rate_limit.windows_gc").increment(deleted);

        Ok(deleted)
    }

    /// 清理空闲行为画像（周期任务调用）
    pub async fn sweep_profiles(&self) -> usize {
        let swept = self.behavior.sweep_idle().await;
        if swept > 0 {
            tracing::debug!(swept = swept, "Idle behavior profiles removed");
        }
        swept
    }

    /// 存储故障：按 fail-open/fail-closed 策略折算出放行或拒绝
    fn storage_failure_decision(
        &self,
        key_id: &str,
        limit: u32,
        reset_at: i64,
        err: &sqlx::Error,
    ) -> RateLimitCheck {
        let mode = if self.fail_open_allowed { "open" } else { "closed" };
        metrics::counter!("rate_limit.storage_failures", "mode" => mode).increment(1);
        tracing::error!(
            key_id = key_id,
            mode = mode,
            error = %err,
            "Rate limit storage failure"
        );

        if self.fail_open_allowed {
            RateLimitCheck {
                key_id: key_id.to_string(),
                allowed: true,
                remaining: limit,
                reset_at,
                limit,
            }
        } else {
            RateLimitCheck {
                key_id: key_id.to_string(),
                allowed: false,
                remaining: 0,
                reset_at,
                limit,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn check(key: &str, allowed: bool, remaining: u32) -> RateLimitCheck {
        RateLimitCheck {
            key_id: key.to_string(),
            allowed,
            remaining,
            reset_at: 0,
            limit: 10,
        }
    }

    #[test]
    fn test_window_bounds_truncation() {
        let (start, reset) = window_bounds(1_700_000_012_345, 60_000);
        assert_eq!(start, 1_699_999_980_000);
        assert_eq!(reset, 1_700_000_040_000);
        assert_eq!(start % 60_000, 0);
    }

    #[test]
    fn test_window_bounds_at_boundary() {
        let (start, reset) = window_bounds(1_700_000_040_000, 60_000);
        assert_eq!(start, 1_700_000_040_000);
        assert_eq!(reset, 1_700_000_100_000);
    }

    #[test]
    fn test_decision_sequence() {
        // 上限 5：前五次放行，remaining 依次 4,3,2,1,0，第六次拒绝
        let expectations = [
            (1, true, 4),
            (2, true, 3),
            (3, true, 2),
            (4, true, 1),
            (5, true, 0),
            (6, false, 0),
        ];

        for (count, allowed, remaining) in expectations {
            assert_eq!(decision(count, 5), (allowed, remaining), "count={count}");
        }
    }

    #[test]
    fn test_adaptive_multiplier_thresholds() {
        assert_eq!(adaptive_multiplier(0.0), 1.2);
        assert_eq!(adaptive_multiplier(0.29), 1.2);
        assert_eq!(adaptive_multiplier(0.3), 1.0);
        assert_eq!(adaptive_multiplier(0.59), 1.0);
        assert_eq!(adaptive_multiplier(0.6), 0.7);
        assert_eq!(adaptive_multiplier(0.79), 0.7);
        assert_eq!(adaptive_multiplier(0.8), 0.4);
        assert_eq!(adaptive_multiplier(0.94), 0.4);
        assert_eq!(adaptive_multiplier(0.95), 0.1);
        assert_eq!(adaptive_multiplier(1.0), 0.1);
    }

    #[test]
    fn test_behavior_multiplier_reputation_tiers() {
        let mut profile = UserBehaviorProfile::new(Utc::now());

        profile.reputation = 85.0;
        assert_eq!(behavior_multiplier(&profile), 1.5);

        profile.reputation = 65.0;
        assert_eq!(behavior_multiplier(&profile), 1.2);

        profile.reputation = 45.0;
        assert_eq!(behavior_multiplier(&profile), 1.0);

        profile.reputation = 20.0;
        assert_eq!(behavior_multiplier(&profile), 0.5);
    }

    #[test]
    fn test_behavior_multiplier_error_rate_and_suspicious() {
        let mut profile = UserBehaviorProfile::new(Utc::now());
        profile.reputation = 45.0;

        profile.error_rate = 0.3;
        assert_eq!(behavior_multiplier(&profile), 0.7);

        profile.error_rate = 0.6;
        assert_eq!(behavior_multiplier(&profile), 0.3);

        // 组合乘数低于下限时被钳制到 0.1
        profile.suspicious_activity = true;
        assert_eq!(behavior_multiplier(&profile), 0.1);
    }

    #[test]
    fn test_behavior_multiplier_clamps_upper_bound() {
        let mut profile = UserBehaviorProfile::new(Utc::now());
        profile.reputation = 95.0;
        profile.error_rate = 0.0;
        assert!(behavior_multiplier(&profile) <= 2.0);
    }

    #[test]
    fn test_effective_limit_floor_and_minimum() {
        assert_eq!(effective_limit(100, 1.2, 1.0), 120);
        assert_eq!(effective_limit(100, 0.7, 1.0), 70);
        assert_eq!(effective_limit(100, 0.7, 0.5), 35);
        assert_eq!(effective_limit(3, 0.1, 0.1), 1); // 向下取整后至少为 1
    }

    #[test]
    fn test_most_restrictive_prefers_denial() {
        let result = most_restrictive(vec![
            check("apiKey:a", true, 7),
            check("user:b", false, 0),
            check("ip:c", true, 2),
        ])
        .unwrap();

        assert!(!result.allowed);
        assert_eq!(result.key_id, "user:b");
    }

    #[test]
    fn test_most_restrictive_smallest_remaining_when_all_allowed() {
        let result = most_restrictive(vec![
            check("apiKey:a", true, 7),
            check("user:b", true, 2),
            check("ip:c", true, 5),
        ])
        .unwrap();

        assert!(result.allowed);
        assert_eq!(result.key_id, "user:b");
        assert_eq!(result.remaining, 2);
    }

    #[test]
    fn test_most_restrictive_empty() {
        assert!(most_restrictive(Vec::new()).is_none());
    }

    #[test]
    fn test_load_tracker_clamps() {
        let tracker = SystemLoadTracker::new();
        assert_eq!(tracker.current_load(), 0.0);

        tracker.set_load(0.75);
        assert_eq!(tracker.current_load(), 0.75);

        tracker.set_load(3.0);
        assert_eq!(tracker.current_load(), 1.0);

        tracker.set_load(-1.0);
        assert_eq!(tracker.current_load(), 0.0);
    }

    #[tokio::test]
    async fn test_behavior_tracker_reputation_updates() {
        let tracker = BehaviorTracker::new();
        let user = Uuid::new_v4();

        tracker.record_request(user, true, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert_eq!(profile.request_count, 1);
        assert!((profile.reputation - 50.1).abs() < 1e-9);

        tracker.record_request(user, false, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!((profile.reputation - 49.1).abs() < 1e-9);
        assert!(profile.error_rate > 0.0);
    }

    #[tokio::test]
    async fn test_behavior_tracker_suspicious_is_sticky() {
        let tracker = BehaviorTracker::new();
        let user = Uuid::new_v4();

        tracker.record_request(user, true, true).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!(profile.suspicious_activity);
        assert!((profile.reputation - 40.0).abs() < 1e-9);

        // 后续正常请求不会清除可疑标记
        tracker.record_request(user, true, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!(profile.suspicious_activity);
    }

    #[tokio::test]
    async fn test_behavior_tracker_error_rate_ema() {
        let tracker = BehaviorTracker::new();
        let user = Uuid::new_v4();

        tracker.record_request(user, false, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!((profile.error_rate - 0.1).abs() < 1e-9);

        tracker.record_request(user, false, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!((profile.error_rate - 0.19).abs() < 1e-9);

        tracker.record_request(user, true, false).await;
        let profile = tracker.profile(user).await.unwrap();
        assert!((profile.error_rate - 0.171).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_behavior_tracker_sweeps_idle_profiles() {
        let tracker = BehaviorTracker::new();
        let stale_user = Uuid::new_v4();
        let fresh_user = Uuid::new_v4();

        tracker.record_request(stale_user, true, false).await;
        tracker.record_request(fresh_user, true, false).await;

        // 人为把一个画像的活动时间拨回 25 小时前
        {
            let mut profiles = tracker.profiles.lock().await;
            if let Some(profile) = profiles.get_mut(&stale_user) {
                profile.last_activity = Utc::now() - Duration::hours(25);
            }
        }

        let swept = tracker.sweep_idle().await;
        assert_eq!(swept, 1);
        assert!(tracker.profile(stale_user).await.is_none());
        assert!(tracker.profile(fresh_user).await.is_some());
    }

    #[test]
    fn test_multiplier_composition_bounds() {
        // 任意组合下生效上限不会为 0
        for load in [0.0, 0.5, 0.9, 1.0] {
            let mut profile = UserBehaviorProfile::new(Utc::now());
            profile.reputation = 0.0;
            profile.error_rate = 1.0;
            profile.suspicious_activity = true;

            let limit =
                effective_limit(1, adaptive_multiplier(load), behavior_multiplier(&profile));
            assert!(limit >= 1);
        }
    }
}
