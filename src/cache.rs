use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::session::Session;

/// What to do with a cached session after a tunnel attempt on it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Leave the session in the slot until a fresh session replaces it.
    ///
    /// Concurrent dials may keep picking up a dead session until one of them
    /// negotiates a new one.
    #[default]
    Keep,
    /// Clear the slot right away if it still holds the failed session.
    EvictOnFailure,
}

/// Single-slot cache for the HTTP/2 session to the proxy.
///
/// The lock only guards the slot. It is never held while a handshake or any
/// other I/O runs, so concurrent dials never queue behind each other here.
#[derive(Debug, Default)]
pub(crate) struct SessionCache {
    slot: Mutex<Option<Session>>,
    policy: StalePolicy,
}

impl SessionCache {
    pub(crate) fn new(policy: StalePolicy) -> Self {
        Self {
            slot: Mutex::new(None),
            policy,
        }
    }

    /// Returns the cached session if there is one and it can take new requests.
    pub(crate) fn try_reuse(&self) -> Option<Session> {
        let slot = self.lock();
        let session = slot.as_ref()?;
        if session.can_take_new_request() {
            trace!(session = session.id(), "cache hit");
            Some(session.clone())
        } else {
            trace!(session = session.id(), "cached session takes no new requests");
            None
        }
    }

    /// Replaces whatever the slot holds. The last writer wins.
    pub(crate) fn store(&self, session: Session) {
        debug!(session = session.id(), "caching session");
        *self.lock() = Some(session);
    }

    /// Reports that a tunnel attempt on `session`, obtained from
    /// [`SessionCache::try_reuse`], failed.
    pub(crate) fn reuse_failed(&self, session: &Session) {
        match self.policy {
            StalePolicy::Keep => {}
            StalePolicy::EvictOnFailure => self.evict(session),
        }
    }

    /// Clears the slot if it still holds `session`.
    pub(crate) fn evict(&self, session: &Session) {
        let mut slot = self.lock();
        if slot
            .as_ref()
            .is_some_and(|cached| cached.raw().same_connection(session.raw()))
        {
            debug!(session = session.id(), "evicting session");
            *slot = None;
        }
    }

    /// Returns the cached session without checking whether it is usable.
    pub(crate) fn peek(&self) -> Option<Session> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        // The slot is always in a consistent state, so a poisoned lock is fine to reuse.
        self.slot.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use n0_error::Result;

    use super::*;
    use crate::tests::h2_session_pair;

    #[tokio::test]
    async fn empty_cache_misses() {
        let cache = SessionCache::default();
        assert!(cache.try_reuse().is_none());
        assert!(cache.peek().is_none());
    }

    #[tokio::test]
    async fn store_then_reuse() -> Result {
        let cache = SessionCache::default();
        let (session, _server) = h2_session_pair().await?;
        cache.store(session.clone());
        let reused = cache.try_reuse().expect("cached");
        assert_eq!(reused.id(), session.id());
        Ok(())
    }

    #[tokio::test]
    async fn last_writer_wins() -> Result {
        let cache = SessionCache::default();
        let (first, _server1) = h2_session_pair().await?;
        let (second, _server2) = h2_session_pair().await?;
        cache.store(first.clone());
        cache.store(second.clone());
        assert_eq!(cache.try_reuse().expect("cached").id(), second.id());
        // The replaced session is still usable on its own.
        assert!(first.can_take_new_request());
        Ok(())
    }

    #[tokio::test]
    async fn closed_session_is_not_reused_but_stays_cached() -> Result {
        let cache = SessionCache::default();
        let (session, _server) = h2_session_pair().await?;
        cache.store(session.clone());
        session.raw().close();
        assert!(cache.try_reuse().is_none());
        assert_eq!(cache.peek().expect("still cached").id(), session.id());
        Ok(())
    }

    #[tokio::test]
    async fn refusing_session_is_not_reused() -> Result {
        let cache = SessionCache::default();
        let (session, _server) = h2_session_pair().await?;
        cache.store(session.clone());
        session.raw().refuse_new_streams();
        assert!(cache.try_reuse().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn keep_policy_leaves_failed_session() -> Result {
        let cache = SessionCache::new(StalePolicy::Keep);
        let (session, _server) = h2_session_pair().await?;
        cache.store(session.clone());
        cache.reuse_failed(&session);
        assert!(cache.peek().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn evict_policy_clears_failed_session() -> Result {
        let cache = SessionCache::new(StalePolicy::EvictOnFailure);
        let (session, _server) = h2_session_pair().await?;
        cache.store(session.clone());
        cache.reuse_failed(&session);
        assert!(cache.peek().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn evict_ignores_replaced_session() -> Result {
        let cache = SessionCache::new(StalePolicy::EvictOnFailure);
        let (old, _server1) = h2_session_pair().await?;
        let (new, _server2) = h2_session_pair().await?;
        cache.store(new.clone());
        cache.reuse_failed(&old);
        assert_eq!(cache.peek().expect("cached").id(), new.id());
        Ok(())
    }
}
