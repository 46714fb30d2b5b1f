use tracing::{error, info, warn};

use super::auth::LoginMethod;

#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn login_success(&self, method: LoginMethod, client_ip: &str, phone: Option<&str>) {
        info!(target: "audit", event = "login_success", method = ?method, client_ip, phone = phone.unwrap_or(""));
    }

    pub fn login_failure(&self, method: LoginMethod, client_ip: &str, reason: &str) {
        warn!(target: "audit", event = "login_failure", method = ?method, client_ip, reason);
    }

    pub fn logout(&self, client_ip: &str) {
        info!(target: "audit", event = "logout", client_ip);
    }

    pub fn session_rejected(&self, client_ip: &str, path: &str) {
        warn!(target: "audit", event = "session_rejected", client_ip, path);
    }

    pub fn password_rejected(&self, client_ip: &str, path: &str) {
        warn!(target: "audit", event = "password_rejected", client_ip, path);
    }

    pub fn rate_limited(&self, client_ip: &str, path: &str) {
        warn!(target: "audit", event = "rate_limited", client_ip, path);
    }

    pub fn advice_changed(&self, advice_id: &str, action: &str) {
        info!(target: "audit", event = "advice_changed", advice_id, action);
    }

    pub fn bulletin_changed(&self, bulletin_id: &str, action: &str) {
        info!(target: "audit", event = "bulletin_changed", bulletin_id, action);
    }

    pub fn phone_list_changed(&self, phone: &str, action: &str, count: usize) {
        info!(target: "audit", event = "phone_list_changed", phone, action, count);
    }

    pub fn sms_sent(&self, phone: &str, client_ip: &str) {
        info!(target: "audit", event = "sms_sent", phone, client_ip);
    }

    pub fn sms_failed(&self, phone: &str, reason: &str) {
        warn!(target: "audit", event = "sms_failed", phone, reason);
    }

    pub fn verification_failed(&self, phone: &str, reason: &str) {
        warn!(target: "audit", event = "verification_failed", phone, reason);
    }

    pub fn internal_error(&self, error_msg: &str) {
        error!(target: "audit", event = "internal_error", error = error_msg);
    }
}
