mod audit;
mod models;
mod permission;

pub use audit::{AuditCategory, AuditEventType, Severity};
pub use models::*;
pub use permission::{Permission, PermissionScope};
