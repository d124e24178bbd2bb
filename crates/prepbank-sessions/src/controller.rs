//! Login admission and device-registry management.
//!
//! ## Registry layout (all under the configured prefix)
//!
//! ```text
//! {p}:user:{id}:devices              list  fingerprints, login order, oldest first
//! {p}:user:{id}:device:{fp}          hash  device_name, platform, browser,
//!                                          first_seen, last_seen, session_count
//! {p}:user:{id}:device:{fp}:sessions set   active session ids
//! {p}:session:{sid}                  str   per-session cache entry (deleted on eviction)
//! {p}:lock:user:{id}                 str   login lock token
//! ```
//!
//! A fingerprint appears at most once in the ordered list. Registration
//! writes the metadata hash before appending to the list, and teardown
//! removes the list entry before deleting metadata, so a torn failure
//! leaves orphaned (TTL-bounded) side keys rather than a list entry
//! pointing at nothing.

use std::sync::Arc;

use prepbank_kv::{KvStore, RetryBackoff, release_lock, try_acquire_lock};

use crate::config::{ConcurrentConfig, OnNewLogin};
use crate::device;
use crate::error::{SessionError, SessionResult};
use crate::fingerprint::device_fingerprint;
use crate::revoker::SessionRevoker;
use crate::types::{DeviceRecord, LoginAttempt, LoginDecision, LoginMeta};

/// Per-user concurrent session controller.
///
/// Mutations to one user's registry are serialized by a short-TTL
/// distributed lock keyed by the user id; there is no in-process lock. The
/// management operations (list, revoke, prune) are deliberately lock-free:
/// they tolerate racing a login the same way two logins tolerate a
/// TTL-expired lock handover.
pub struct ConcurrentSessionController {
    store: Arc<dyn KvStore>,
    revoker: Arc<dyn SessionRevoker>,
    config: ConcurrentConfig,
}

impl ConcurrentSessionController {
    pub fn new(
        store: Arc<dyn KvStore>,
        revoker: Arc<dyn SessionRevoker>,
        config: ConcurrentConfig,
    ) -> Self {
        Self {
            store,
            revoker,
            config,
        }
    }

    /// Admit or deny a login under the configured device policy.
    ///
    /// Never returns an error: any failure in the flow (store down, lock
    /// contended past its budget, revoker failure mid-eviction) is logged
    /// and converted to an allow. This is a deliberate risk acceptance —
    /// users must be able to log in while the coordination store is
    /// unhealthy, at the cost of the device limit going unenforced for the
    /// duration.
    pub async fn on_login(&self, attempt: &LoginAttempt) -> LoginDecision {
        match self.try_login(attempt).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    user_id = %attempt.user_id,
                    error = %e,
                    "session control degraded, allowing login"
                );
                LoginDecision::allowed()
            }
        }
    }

    /// Read-only projection of the user's registered devices, oldest first.
    /// Integer fields are parsed from their stored string form; unparsable
    /// values read as zero.
    pub async fn list_devices(&self, user_id: &str) -> SessionResult<Vec<DeviceRecord>> {
        let fingerprints = self.store.lrange(&self.devices_key(user_id), 0, -1).await?;
        let mut records = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            let meta = self.store.hgetall(&self.device_key(user_id, &fp)).await?;
            if meta.is_empty() {
                // Orphaned list entry from a torn teardown; not a device.
                continue;
            }
            let text = |k: &str| meta.get(k).cloned().unwrap_or_default();
            let number = |k: &str| {
                meta.get(k)
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or(0)
            };
            records.push(DeviceRecord {
                fingerprint: fp.clone(),
                device_name: text("device_name"),
                platform: text("platform"),
                browser: text("browser"),
                first_seen: number("first_seen"),
                last_seen: number("last_seen"),
                session_count: number("session_count"),
            });
        }
        Ok(records)
    }

    /// Tear down one device: revoke its sessions at the source of truth and
    /// remove it from the registry. Returns `false` if the fingerprint is
    /// not registered.
    pub async fn revoke_device(&self, user_id: &str, fingerprint: &str) -> SessionResult<bool> {
        let known = self.store.lrange(&self.devices_key(user_id), 0, -1).await?;
        if !known.iter().any(|f| f == fingerprint) {
            return Ok(false);
        }
        self.teardown_device(user_id, fingerprint).await?;
        Ok(true)
    }

    /// Tear down every device, optionally sparing one fingerprint (the
    /// "sign out everywhere else" action). Returns the number of devices
    /// revoked.
    pub async fn revoke_all_devices(
        &self,
        user_id: &str,
        except_fingerprint: Option<&str>,
    ) -> SessionResult<u32> {
        let known = self.store.lrange(&self.devices_key(user_id), 0, -1).await?;
        let mut revoked = 0;
        for fp in known {
            if Some(fp.as_str()) == except_fingerprint {
                continue;
            }
            self.teardown_device(user_id, &fp).await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    /// Drop session ids that are no longer active from every device, then
    /// drop devices left with no sessions. Stale sessions are already dead
    /// upstream, so the revoker is not called.
    pub async fn prune_stale_sessions(
        &self,
        user_id: &str,
        active_session_ids: &[String],
    ) -> SessionResult<()> {
        let known = self.store.lrange(&self.devices_key(user_id), 0, -1).await?;
        for fp in known {
            let sessions_key = self.device_sessions_key(user_id, &fp);
            let current = self.store.smembers(&sessions_key).await?;
            let stale: Vec<String> = current
                .into_iter()
                .filter(|sid| !active_session_ids.iter().any(|a| a == sid))
                .collect();
            if !stale.is_empty() {
                self.store.srem(&sessions_key, &stale).await?;
            }
            if self.store.smembers(&sessions_key).await?.is_empty() {
                self.store
                    .lrem(&self.devices_key(user_id), 0, &fp)
                    .await?;
                self.store.delete(&sessions_key).await?;
                self.store.delete(&self.device_key(user_id, &fp)).await?;
                tracing::debug!(user_id = %user_id, fingerprint = %fp, "pruned device with no live sessions");
            }
        }
        Ok(())
    }

    async fn try_login(&self, attempt: &LoginAttempt) -> SessionResult<LoginDecision> {
        let fp = device_fingerprint(
            attempt.device_id.as_deref(),
            &attempt.ip,
            &attempt.user_agent,
        );
        let lock_key = self.lock_key(&attempt.user_id);
        let mut backoff =
            RetryBackoff::new(self.config.lock_retry_delay, self.config.lock_max_attempts);

        let token = loop {
            if let Some(token) =
                try_acquire_lock(self.store.as_ref(), &lock_key, self.config.lock_ttl).await?
            {
                break token;
            }
            match backoff.next_delay() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(SessionError::LockTimeout {
                        user_id: attempt.user_id.clone(),
                    });
                }
            }
        };

        let result = self.admit(attempt, &fp).await;

        // Token-checked release, same as the cache lock: if our TTL lapsed
        // and another login took the lock, leave it alone.
        if let Err(e) = release_lock(self.store.as_ref(), &lock_key, &token).await {
            tracing::warn!(key = %lock_key, error = %e, "failed to release login lock");
        }
        result
    }

    async fn admit(&self, attempt: &LoginAttempt, fp: &str) -> SessionResult<LoginDecision> {
        let devices_key = self.devices_key(&attempt.user_id);
        let fingerprints = self.store.lrange(&devices_key, 0, -1).await?;

        // A known device is always admitted; the cap only gates new ones.
        if fingerprints.iter().any(|f| f == fp) {
            self.record_login(attempt, fp).await?;
            self.refresh_ttls(&attempt.user_id, fp).await?;
            return Ok(LoginDecision::allowed());
        }

        let current = fingerprints.len() as u32;
        if current < self.config.max_devices {
            self.register_device(attempt, fp).await?;
            return Ok(LoginDecision::allowed());
        }

        match self.config.on_new_login {
            OnNewLogin::Deny => {
                tracing::info!(
                    user_id = %attempt.user_id,
                    current_devices = current,
                    max_devices = self.config.max_devices,
                    "login denied at device cap"
                );
                Ok(LoginDecision::denied(
                    format!(
                        "device limit reached: {current} of {} allowed devices are active",
                        self.config.max_devices
                    ),
                    LoginMeta {
                        max_devices: self.config.max_devices,
                        current_devices: current,
                        strategy: OnNewLogin::Deny,
                    },
                ))
            }
            OnNewLogin::KickOldest => {
                if let Some(oldest) = self.store.lindex(&devices_key, 0).await? {
                    tracing::info!(
                        user_id = %attempt.user_id,
                        evicted = %oldest,
                        "device cap reached, evicting oldest device"
                    );
                    self.teardown_device(&attempt.user_id, &oldest).await?;
                }
                self.register_device(attempt, fp).await?;
                Ok(LoginDecision::allowed())
            }
            OnNewLogin::Allow => {
                self.register_device(attempt, fp).await?;
                Ok(LoginDecision::allowed())
            }
        }
    }

    /// Subsequent login from an already-registered device.
    async fn record_login(&self, attempt: &LoginAttempt, fp: &str) -> SessionResult<()> {
        let user = &attempt.user_id;
        self.store
            .sadd(
                &self.device_sessions_key(user, fp),
                &[attempt.session_id.clone()],
            )
            .await?;
        self.store
            .hset(
                &self.device_key(user, fp),
                &[("last_seen".to_string(), unix_now().to_string())],
            )
            .await?;
        self.store
            .hincrby(&self.device_key(user, fp), "session_count", 1)
            .await?;
        Ok(())
    }

    /// First login from a new device.
    async fn register_device(&self, attempt: &LoginAttempt, fp: &str) -> SessionResult<()> {
        let user = &attempt.user_id;
        let info = device::ClientInfo::from_user_agent(&attempt.user_agent);
        let now = unix_now().to_string();
        let fields = vec![
            (
                "device_name".to_string(),
                device::device_name(Some(&attempt.user_agent)),
            ),
            ("platform".to_string(), info.platform),
            ("browser".to_string(), info.browser),
            ("first_seen".to_string(), now.clone()),
            ("last_seen".to_string(), now),
            ("session_count".to_string(), "1".to_string()),
        ];
        // Metadata and session set go in before the list append; the list
        // must never name a device whose metadata is missing.
        self.store.hset(&self.device_key(user, fp), &fields).await?;
        self.store
            .sadd(
                &self.device_sessions_key(user, fp),
                &[attempt.session_id.clone()],
            )
            .await?;
        self.store
            .rpush(&self.devices_key(user), &[fp.to_string()])
            .await?;
        self.refresh_ttls(user, fp).await?;
        tracing::debug!(user_id = %user, fingerprint = %fp, "registered new device");
        Ok(())
    }

    /// Bounded retention: the whole registry disappears after
    /// `registry_ttl` without a login.
    async fn refresh_ttls(&self, user_id: &str, fp: &str) -> SessionResult<()> {
        let ttl = self.config.registry_ttl;
        self.store.expire(&self.devices_key(user_id), ttl).await?;
        self.store
            .expire(&self.device_key(user_id, fp), ttl)
            .await?;
        self.store
            .expire(&self.device_sessions_key(user_id, fp), ttl)
            .await?;
        Ok(())
    }

    /// Shared teardown for eviction and explicit revocation.
    async fn teardown_device(&self, user_id: &str, fp: &str) -> SessionResult<()> {
        let sessions_key = self.device_sessions_key(user_id, fp);
        let session_ids = self.store.smembers(&sessions_key).await?;

        for sid in &session_ids {
            self.store.delete(&self.session_key(sid)).await?;
        }
        if !session_ids.is_empty() {
            self.revoker
                .revoke(&session_ids)
                .await
                .map_err(SessionError::Revoke)?;
        }

        self.store.lrem(&self.devices_key(user_id), 0, fp).await?;
        self.store.delete(&sessions_key).await?;
        self.store.delete(&self.device_key(user_id, fp)).await?;
        tracing::info!(
            user_id = %user_id,
            fingerprint = %fp,
            sessions = session_ids.len(),
            "device revoked"
        );
        Ok(())
    }

    fn devices_key(&self, user_id: &str) -> String {
        format!("{}:user:{}:devices", self.config.prefix, user_id)
    }

    fn device_key(&self, user_id: &str, fp: &str) -> String {
        format!("{}:user:{}:device:{}", self.config.prefix, user_id, fp)
    }

    fn device_sessions_key(&self, user_id: &str, fp: &str) -> String {
        format!("{}:user:{}:device:{}:sessions", self.config.prefix, user_id, fp)
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.config.prefix, session_id)
    }

    fn lock_key(&self, user_id: &str) -> String {
        format!("{}:lock:user:{}", self.config.prefix, user_id)
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
