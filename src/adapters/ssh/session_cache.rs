// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use super::{SessionManager, SshParams};

pub trait SessionFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<SessionManager>;
}

#[derive(Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn build(&self, params: SshParams) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(params))
    }
}

struct Entry {
    session: Arc<SessionManager>,
    deadline: Instant,
}

/// Session cache keyed by username with a sliding idle deadline. Every
/// acquire pushes the deadline out by the full TTL; entries whose deadline
/// passed, or whose connection parameters changed (new key, new host), are
/// shut down and rebuilt.
pub struct SessionCache {
    sessions: Mutex<HashMap<String, Entry>>,
    factory: Arc<dyn SessionFactory>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(factory: Arc<dyn SessionFactory>, ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            ttl,
        }
    }

    /// Returns the live session for the account, building one if the cached
    /// entry is missing, expired or stale. Atomic test-and-set: two
    /// concurrent acquires for the same account get the same session.
    pub async fn acquire(&self, params: SshParams) -> Arc<SessionManager> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(&params.username) {
            if entry.deadline > now && entry.session.matches_params(&params) {
                entry.deadline = now + self.ttl;
                return entry.session.clone();
            }
        }
        if let Some(stale) = sessions.remove(&params.username) {
            stale.session.shutdown().await;
        }

        let session = self.factory.build(params.clone());
        sessions.insert(
            params.username,
            Entry {
                session: session.clone(),
                deadline: now + self.ttl,
            },
        );
        session
    }

    pub async fn evict(&self, username: &str) -> bool {
        let entry = self.sessions.lock().await.remove(username);
        if let Some(entry) = entry {
            entry.session.shutdown().await;
            return true;
        }
        false
    }

    pub async fn clear(&self) {
        let entries: Vec<Entry> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.session.shutdown().await;
        }
    }

    /// Shuts down every entry whose deadline passed.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<Entry> = {
            let mut sessions = self.sessions.lock().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(name, _)| name.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|name| sessions.remove(&name))
                .collect()
        };
        for entry in expired {
            log::info!("closing idle ssh session");
            entry.session.shutdown().await;
        }
    }

    /// Periodically closes idle sessions in the background.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.ttl / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::app::types::AuthMethod;

    struct CountingFactory {
        builds: AtomicUsize,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                builds: AtomicUsize::new(0),
            }
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    impl SessionFactory for CountingFactory {
        fn build(&self, params: SshParams) -> Arc<SessionManager> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Arc::new(SessionManager::new(params))
        }
    }

    fn params(username: &str, key: &str) -> SshParams {
        let addr: SocketAddr = "127.0.0.1:22".parse().unwrap();
        SshParams {
            host: "cluster.test".to_string(),
            addr,
            username: username.to_string(),
            auth: AuthMethod::Key {
                private_key: key.to_string(),
                passphrase: None,
            },
            keepalive_secs: 15,
        }
    }

    fn cache(factory: Arc<CountingFactory>, ttl_secs: u64) -> SessionCache {
        SessionCache::new(factory, Duration::from_secs(ttl_secs))
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_reuses_a_live_session() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        let first = cache.acquire(params("ada", "k1")).await;
        let second = cache.acquire(params("ada", "k1")).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_rebuilt() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        let first = cache.acquire(params("ada", "k1")).await;
        tokio::time::advance(Duration::from_secs(301)).await;
        let second = cache.acquire(params("ada", "k1")).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_slides_the_deadline() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        let first = cache.acquire(params("ada", "k1")).await;
        // Touch the entry shortly before expiry, then step past where the
        // original deadline would have been.
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = cache.acquire(params("ada", "k1")).await;
        assert!(Arc::ptr_eq(&first, &second));
        tokio::time::advance(Duration::from_secs(299)).await;
        let third = cache.acquire(params("ada", "k1")).await;
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(factory.builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_params_rebuild_the_session() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        let first = cache.acquire(params("ada", "k1")).await;
        let second = cache.acquire(params("ada", "k2")).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn accounts_do_not_share_sessions() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        let ada = cache.acquire(params("ada", "k1")).await;
        let grace = cache.acquire(params("grace", "k1")).await;
        assert!(!Arc::ptr_eq(&ada, &grace));
    }

    #[tokio::test(start_paused = true)]
    async fn evict_removes_the_entry() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        cache.acquire(params("ada", "k1")).await;
        assert!(cache.evict("ada").await);
        assert!(!cache.evict("ada").await);
        cache.acquire(params("ada", "k1")).await;
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_expired_entries() {
        let factory = Arc::new(CountingFactory::new());
        let cache = cache(factory.clone(), 300);
        cache.acquire(params("ada", "k1")).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.acquire(params("grace", "k1")).await;
        tokio::time::advance(Duration::from_secs(150)).await;
        cache.sweep().await;
        assert!(!cache.evict("ada").await, "ada should have been swept");
        assert!(cache.evict("grace").await, "grace should have survived");
    }
}
