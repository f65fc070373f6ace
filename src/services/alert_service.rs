//! 告警通知服务
//! 审计链完整性失败等事件的升级出口，当前实现为结构化日志 + 指标

use tracing::{error, info, warn};

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Default)]
pub struct AlertService;

impl AlertService {
    pub fn new() -> Self {
        Self
    }

    /// 发送告警
    /// Critical 级别预期接入值班通道；这里统一落结构化日志并计数，
    /// 由日志管道路由到外部通知系统
    pub fn notify(&self, severity: AlertSeverity, title: &str, detail: &str) {
        metrics::counter!("alerts.sent", "severity" => severity.as_str()).increment(1);

        match severity {
            AlertSeverity::Critical => {
                error!(alert = title, detail = detail, severity = severity.as_str(), "ALERT");
            }
            AlertSeverity::Warning => {
                warn!(alert = title, detail = detail, severity = severity.as_str(), "ALERT");
            }
            AlertSeverity::Info => {
                info!(alert = title, detail = detail, severity = severity.as_str(), "ALERT");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_labels() {
        assert_eq!(AlertSeverity::Info.as_str(), "info");
        assert_eq!(AlertSeverity::Warning.as_str(), "warning");
        assert_eq!(AlertSeverity::Critical.as_str(), "critical");
    }
}
