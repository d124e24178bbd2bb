//! Session-control data types.

use serde::{Deserialize, Serialize};

use crate::config::OnNewLogin;

/// One login event as seen by the controller.
///
/// Retries inside the controller always reuse this struct wholesale, so a
/// retry can never drop a field (losing `device_id` on retry would silently
/// change the computed fingerprint).
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub user_id: String,
    pub ip: String,
    pub user_agent: String,
    /// Client-provided stable device identifier, when available.
    pub device_id: Option<String>,
    pub session_id: String,
}

/// Outcome of a login admission check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginDecision {
    pub allowed: bool,
    /// Human-readable explanation, set when the login was denied. Callers
    /// must surface it verbatim.
    pub message: Option<String>,
    /// Structured detail for rendering an actionable error.
    pub meta: Option<LoginMeta>,
}

impl LoginDecision {
    pub(crate) fn allowed() -> Self {
        Self {
            allowed: true,
            message: None,
            meta: None,
        }
    }

    pub(crate) fn denied(message: String, meta: LoginMeta) -> Self {
        Self {
            allowed: false,
            message: Some(message),
            meta: Some(meta),
        }
    }
}

/// Device-count context attached to a denial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginMeta {
    pub max_devices: u32,
    pub current_devices: u32,
    pub strategy: OnNewLogin,
}

/// Read-only projection of one registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub fingerprint: String,
    pub device_name: String,
    pub platform: String,
    pub browser: String,
    /// Unix timestamp of the first login from this device.
    pub first_seen: i64,
    /// Unix timestamp of the most recent login.
    pub last_seen: i64,
    /// Total logins recorded for this device.
    pub session_count: i64,
}
