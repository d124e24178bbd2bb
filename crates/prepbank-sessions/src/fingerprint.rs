//! Stable device fingerprinting.

use sha2::{Digest, Sha256};

/// Hex characters kept from the digest. Collision odds at this width are
/// negligible for a per-user registry of a handful of devices.
const FINGERPRINT_LEN: usize = 16;

/// Compute a stable fingerprint for a device.
///
/// Prefers the client-supplied `device_id`; falls back to hashing
/// `ip:user_agent` when it is absent or empty.
///
/// # Limitation
///
/// The fallback is not device-stable behind shared NAT or proxies: two
/// different devices with the same egress IP and browser build collapse
/// into one fingerprint, and the same device changes fingerprint when its
/// IP changes. This is a known approximation; clients that care should
/// send a persistent `device_id`.
pub fn device_fingerprint(device_id: Option<&str>, ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    match device_id {
        Some(id) if !id.is_empty() => hasher.update(id.as_bytes()),
        _ => {
            hasher.update(ip.as_bytes());
            hasher.update(b":");
            hasher.update(user_agent.as_bytes());
        }
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..FINGERPRINT_LEN].to_string()
}
