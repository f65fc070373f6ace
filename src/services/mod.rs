//! Business logic services layer

pub mod alert_service;
pub mod api_key_service;
pub mod audit_service;
pub mod rate_limit_service;

pub use alert_service::{AlertService, AlertSeverity};
pub use api_key_service::ApiKeyService;
pub use audit_service::AuditService;
pub use rate_limit_service::RateLimitService;
