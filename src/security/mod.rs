pub mod audit_log;
pub mod auth;
pub mod phones;
pub mod rate_limit;
