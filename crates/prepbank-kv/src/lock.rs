//! Distributed lock primitives.
//!
//! A lock is an ordinary string key holding a random token, written with
//! `SET NX EX` and released with the token-checked delete. The TTL is the
//! real safety net: a crashed holder never has to release explicitly, and a
//! holder that outlives its TTL cannot delete a lock re-acquired by someone
//! else. Locks are advisory; protected sections must tolerate at most one
//! extra execution after a TTL-driven handover.

use std::time::Duration;

use rand::Rng;

use crate::error::KvResult;
use crate::store::{KvStore, SetOptions};

/// Ceiling for exponential backoff between lock attempts.
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Generate a random lock token (16 bytes, hex-encoded).
pub fn lock_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Single lock-acquisition attempt.
///
/// Returns the holder token on success, `None` if another holder owns the
/// key. Retry policy is the caller's concern (see [`RetryBackoff`]).
pub async fn try_acquire_lock(
    store: &dyn KvStore,
    key: &str,
    ttl: Duration,
) -> KvResult<Option<String>> {
    let token = lock_token();
    let acquired = store
        .set(key, &token, SetOptions::new().nx().ex(ttl))
        .await?;
    Ok(acquired.then_some(token))
}

/// Token-checked release. Returns `false` when the lock had already expired
/// or was taken over by another holder; that outcome is expected and safe to
/// ignore.
pub async fn release_lock(store: &dyn KvStore, key: &str, token: &str) -> KvResult<bool> {
    store.compare_and_delete(key, token).await
}

/// Bounded exponential backoff with jitter for lock-contention retry loops.
///
/// Each call to [`RetryBackoff::next_delay`] consumes one attempt and
/// returns the delay to sleep before the next try, or `None` once the
/// attempt budget is spent. Jitter is ±50% so contending callers do not
/// retry in lockstep.
#[derive(Debug)]
pub struct RetryBackoff {
    delay: Duration,
    attempts_left: u32,
}

impl RetryBackoff {
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay: initial_delay,
            attempts_left: max_attempts,
        }
    }

    /// Next sleep duration, or `None` when the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let base = self.delay;
        self.delay = (self.delay * 2).min(BACKOFF_CAP);
        let millis = base.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis + millis / 2);
        Some(Duration::from_millis(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let kv = MemoryKv::new();
        let token = try_acquire_lock(&kv, "lock:k", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(
            try_acquire_lock(&kv, "lock:k", Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
        assert!(release_lock(&kv, "lock:k", &token).await.unwrap());
        assert!(
            try_acquire_lock(&kv, "lock:k", Duration::from_secs(5))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn release_with_foreign_token_is_refused() {
        let kv = MemoryKv::new();
        let _token = try_acquire_lock(&kv, "lock:k", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(!release_lock(&kv, "lock:k", "someone-else").await.unwrap());
        assert!(kv.exists("lock:k").await.unwrap());
    }

    #[test]
    fn backoff_budget_is_finite_and_grows() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), 3);
        let mut delays = Vec::new();
        while let Some(d) = backoff.next_delay() {
            delays.push(d);
        }
        assert_eq!(delays.len(), 3);
        // Jitter is ±50% of the undoubled base for each attempt.
        assert!(delays[0] >= Duration::from_millis(50) && delays[0] <= Duration::from_millis(150));
        assert!(delays[2] >= Duration::from_millis(200) && delays[2] <= Duration::from_millis(600));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(lock_token(), lock_token());
        assert_eq!(lock_token().len(), 32);
    }
}
