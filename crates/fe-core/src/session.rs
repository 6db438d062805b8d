use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use fe_platform::{ExplorerError, FileExplorer};

use crate::connection::{self, Connector, Identity};

/// Opaque per-login key carried by the client (cookie value)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accepts only keys shaped like the ones `generate` hands out
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 32 && raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(raw.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("not logged in")]
    Unauthenticated,
    #[error(transparent)]
    Connect(#[from] ExplorerError),
}

/// What a request gets back for a bound session
#[derive(Clone)]
pub struct BoundSession {
    pub username: String,
    pub explorer: Arc<dyn FileExplorer>,
}

struct Session {
    username: String,
    explorer: Arc<dyn FileExplorer>,
    bound_at: Instant,
}

#[derive(Default)]
struct SlotState {
    session: Option<Session>,
    /// Set once the slot has been dropped from the map; a task that raced
    /// with the removal must look the key up again.
    retired: bool,
}

type Slot = Arc<tokio::sync::Mutex<SlotState>>;

/// Binds session keys to live file explorers.
///
/// Each key has its own async lock, so logins for one key are serialized
/// while different keys proceed in parallel. Lock order is always slot, then
/// map; the map lock is never held across an await.
pub struct SessionBinder {
    connector: Arc<dyn Connector>,
    ttl: Duration,
    slots: Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionBinder {
    pub fn new(connector: Arc<dyn Connector>, ttl: Duration) -> Self {
        Self {
            connector,
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Authenticate `identity` and bind a freshly connected explorer to `key`.
    /// A session already bound to the key is closed and replaced. On failure
    /// the key ends up unbound.
    pub async fn login(&self, key: &SessionKey, identity: Identity) -> Result<(), BindError> {
        loop {
            let slot = self.get_or_insert_slot(key);
            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }

            let connected = connection::connect(self.connector.as_ref(), &identity).await;

            if let Some(old) = state.session.take() {
                info!("replacing existing session for {}", old.username);
                close_explorer(&old.explorer).await;
            }

            return match connected {
                Ok(explorer) => {
                    info!("session bound for {}", identity.username);
                    state.session = Some(Session {
                        username: identity.username.clone(),
                        explorer,
                        bound_at: Instant::now(),
                    });
                    Ok(())
                }
                Err(e) => {
                    self.retire(key, &slot, &mut state);
                    Err(BindError::Connect(e))
                }
            };
        }
    }

    /// Look up the explorer bound to `key`. Expired or dead sessions are
    /// evicted and reported as unauthenticated.
    pub async fn resolve(&self, key: &SessionKey) -> Result<BoundSession, BindError> {
        let slot = self.get_slot(key).ok_or(BindError::Unauthenticated)?;
        let mut state = slot.lock().await;

        let (expired, alive) = match &state.session {
            Some(s) => (s.bound_at.elapsed() >= self.ttl, s.explorer.is_ready()),
            None => (false, false),
        };

        if expired || !alive {
            if let Some(old) = state.session.take() {
                if expired {
                    info!("session for {} expired", old.username);
                } else {
                    warn!("session for {} lost its connection", old.username);
                }
                close_explorer(&old.explorer).await;
            }
            self.retire(key, &slot, &mut state);
            return Err(BindError::Unauthenticated);
        }

        match &state.session {
            Some(s) => Ok(BoundSession {
                username: s.username.clone(),
                explorer: s.explorer.clone(),
            }),
            None => Err(BindError::Unauthenticated),
        }
    }

    /// Drop a session whose connection turned out to be unusable
    pub async fn invalidate(&self, key: &SessionKey) -> bool {
        let evicted = self.evict(key).await;
        if evicted {
            warn!("session invalidated after connection failure");
        }
        evicted
    }

    /// Close the session's explorer and forget the key
    pub async fn logout(&self, key: &SessionKey) -> bool {
        let evicted = self.evict(key).await;
        if evicted {
            info!("session logged out");
        }
        evicted
    }

    /// Evict every session older than the TTL. Returns how many were closed.
    pub async fn evict_expired(&self) -> usize {
        let slots: Vec<(SessionKey, Slot)> = self
            .lock_slots()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        let mut evicted = 0;
        for (key, slot) in slots {
            let mut state = slot.lock().await;
            if state.retired {
                continue;
            }
            let expired = match &state.session {
                Some(s) => s.bound_at.elapsed() >= self.ttl,
                // Only a failed login leaves an empty slot, and it retires it
                None => false,
            };
            if expired {
                if let Some(old) = state.session.take() {
                    info!("session for {} expired", old.username);
                    close_explorer(&old.explorer).await;
                }
                self.retire(&key, &slot, &mut state);
                evicted += 1;
            }
        }
        evicted
    }

    /// Periodically sweep expired sessions
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let binder = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                let Some(binder) = binder.upgrade() else {
                    break;
                };
                let evicted = binder.evict_expired().await;
                if evicted > 0 {
                    info!("reaper evicted {} expired session(s)", evicted);
                }
            }
            debug!("session reaper stopped");
        })
    }

    /// Close every session, for shutdown
    pub async fn close_all(&self) {
        let keys: Vec<SessionKey> = self.lock_slots().keys().cloned().collect();
        info!("closing {} session(s)", keys.len());
        for key in keys {
            self.evict(&key).await;
        }
    }

    async fn evict(&self, key: &SessionKey) -> bool {
        let Some(slot) = self.get_slot(key) else {
            return false;
        };
        let mut state = slot.lock().await;
        if state.retired {
            return false;
        }
        let had_session = match state.session.take() {
            Some(old) => {
                close_explorer(&old.explorer).await;
                true
            }
            None => false,
        };
        self.retire(key, &slot, &mut state);
        had_session
    }

    /// Remove `slot` from the map. Caller holds the slot lock.
    fn retire(&self, key: &SessionKey, slot: &Slot, state: &mut SlotState) {
        state.retired = true;
        let mut slots = self.lock_slots();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    fn get_slot(&self, key: &SessionKey) -> Option<Slot> {
        self.lock_slots().get(key).cloned()
    }

    fn get_or_insert_slot(&self, key: &SessionKey) -> Slot {
        self.lock_slots().entry(key.clone()).or_default().clone()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Slot>> {
        // A panic while holding this lock cannot leave the map inconsistent
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn close_explorer(explorer: &Arc<dyn FileExplorer>) {
    if let Err(e) = explorer.close().await {
        warn!("error closing file explorer: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use fe_platform::{DirectoryEntry, Result as FeResult};
    use tokio::io::AsyncRead;

    use super::*;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        live: AtomicUsize,
        closes: AtomicUsize,
    }

    struct MockExplorer {
        counters: Arc<Counters>,
        ready: AtomicBool,
        fail_init: bool,
    }

    #[async_trait]
    impl FileExplorer for MockExplorer {
        async fn init(&self) -> FeResult<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail_init {
                return Err(ExplorerError::Connect("refused".into()));
            }
            self.ready.store(true, Ordering::SeqCst);
            self.counters.live.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        async fn list_dir(&self, _path: &str) -> FeResult<Vec<DirectoryEntry>> {
            Ok(Vec::new())
        }
        async fn mkdir(&self, _path: &str) -> FeResult<()> {
            Ok(())
        }
        async fn rename(&self, _old: &str, _new: &str) -> FeResult<()> {
            Ok(())
        }
        async fn remove_item(&self, _path: &str) -> FeResult<()> {
            Ok(())
        }
        async fn copy_item(&self, _source: &str, _target: &str) -> FeResult<()> {
            Ok(())
        }
        async fn chmod_item(&self, _path: &str, _mode: u32, _recursive: bool) -> FeResult<()> {
            Ok(())
        }
        async fn upload_file(
            &self,
            _destination: &str,
            _reader: &mut (dyn AsyncRead + Send + Unpin),
            _file_name: &str,
        ) -> FeResult<()> {
            Ok(())
        }
        async fn get_content(&self, _path: &str) -> FeResult<String> {
            Ok(String::new())
        }
        async fn edit(&self, _path: &str, _content: &str) -> FeResult<()> {
            Ok(())
        }
        async fn close(&self) -> FeResult<()> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            if self.ready.swap(false, Ordering::SeqCst) {
                self.counters.live.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct MockConnector {
        counters: Arc<Counters>,
        password: &'static str,
    }

    impl Connector for MockConnector {
        fn create(&self, identity: &Identity) -> std::result::Result<Arc<dyn FileExplorer>, ExplorerError> {
            self.counters.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockExplorer {
                counters: self.counters.clone(),
                ready: AtomicBool::new(false),
                fail_init: identity.secret() != self.password,
            }))
        }
        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn binder(ttl: Duration) -> (Arc<SessionBinder>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let connector = Arc::new(MockConnector {
            counters: counters.clone(),
            password: "pw",
        });
        (Arc::new(SessionBinder::new(connector, ttl)), counters)
    }

    #[test]
    fn test_session_key_shape() {
        let key = SessionKey::generate();
        assert_eq!(key.as_str().len(), 32);
        assert_eq!(SessionKey::parse(key.as_str()), Some(key.clone()));
        assert_ne!(SessionKey::generate(), key);
        assert!(SessionKey::parse("alice").is_none());
        assert!(SessionKey::parse("../../etc/passwd/xxxxxxxxxxxxxxxx").is_none());
    }

    #[tokio::test]
    async fn test_login_then_resolve() {
        let (binder, counters) = binder(Duration::from_secs(60));
        let key = SessionKey::generate();

        assert!(matches!(binder.resolve(&key).await, Err(BindError::Unauthenticated)));
        binder.login(&key, Identity::new("alice", "pw")).await.unwrap();

        let bound = binder.resolve(&key).await.unwrap();
        assert_eq!(bound.username, "alice");
        assert!(bound.explorer.is_ready());
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_login_caches_nothing() {
        let (binder, counters) = binder(Duration::from_secs(60));
        let key = SessionKey::generate();

        let err = binder.login(&key, Identity::new("alice", "bad")).await.unwrap_err();
        assert!(matches!(err, BindError::Connect(ExplorerError::Connect(_))));
        assert!(binder.is_empty());
        assert!(matches!(binder.resolve(&key).await, Err(BindError::Unauthenticated)));
        // the failed explorer was still closed
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_logins_leave_one_live_explorer() {
        let (binder, counters) = binder(Duration::from_secs(60));
        let key = SessionKey::generate();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let binder = binder.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                binder.login(&key, Identity::new("alice", "pw")).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(counters.created.load(Ordering::SeqCst), 8);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert_eq!(binder.len(), 1);
        assert!(binder.resolve(&key).await.unwrap().explorer.is_ready());
    }

    #[tokio::test]
    async fn test_logout_closes_and_requires_new_login() {
        let (binder, counters) = binder(Duration::from_secs(60));
        let key = SessionKey::generate();
        binder.login(&key, Identity::new("alice", "pw")).await.unwrap();
        let old = binder.resolve(&key).await.unwrap().explorer;

        assert!(binder.logout(&key).await);
        assert!(!old.is_ready());
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(matches!(binder.resolve(&key).await, Err(BindError::Unauthenticated)));
        assert!(!binder.logout(&key).await);

        binder.login(&key, Identity::new("alice", "pw")).await.unwrap();
        let fresh = binder.resolve(&key).await.unwrap().explorer;
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[tokio::test]
    async fn test_keys_do_not_share_explorers() {
        let (binder, _) = binder(Duration::from_secs(60));
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        binder.login(&a, Identity::new("alice", "pw")).await.unwrap();
        binder.login(&b, Identity::new("bob", "pw")).await.unwrap();

        let sa = binder.resolve(&a).await.unwrap();
        let sb = binder.resolve(&b).await.unwrap();
        assert_eq!(sa.username, "alice");
        assert_eq!(sb.username, "bob");
        assert!(!Arc::ptr_eq(&sa.explorer, &sb.explorer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_evicted_and_closed() {
        let (binder, counters) = binder(Duration::from_secs(100));
        let key = SessionKey::generate();
        binder.login(&key, Identity::new("alice", "pw")).await.unwrap();

        time::advance(Duration::from_secs(99)).await;
        assert!(binder.resolve(&key).await.is_ok());

        time::advance(Duration::from_secs(2)).await;
        assert!(matches!(binder.resolve(&key).await, Err(BindError::Unauthenticated)));
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(binder.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_sweeps_only_old_sessions() {
        let (binder, counters) = binder(Duration::from_secs(100));
        let old = SessionKey::generate();
        let young = SessionKey::generate();
        binder.login(&old, Identity::new("alice", "pw")).await.unwrap();
        time::advance(Duration::from_secs(60)).await;
        binder.login(&young, Identity::new("bob", "pw")).await.unwrap();
        time::advance(Duration::from_secs(50)).await;

        assert_eq!(binder.evict_expired().await, 1);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);
        assert!(binder.resolve(&young).await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_connection_is_evicted_on_resolve() {
        let (binder, _) = binder(Duration::from_secs(60));
        let key = SessionKey::generate();
        binder.login(&key, Identity::new("alice", "pw")).await.unwrap();

        // simulate the transport dying underneath the session
        binder.resolve(&key).await.unwrap().explorer.close().await.unwrap();
        assert!(matches!(binder.resolve(&key).await, Err(BindError::Unauthenticated)));
        assert!(binder.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_and_close_all() {
        let (binder, counters) = binder(Duration::from_secs(60));
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        binder.login(&a, Identity::new("alice", "pw")).await.unwrap();
        binder.login(&b, Identity::new("bob", "pw")).await.unwrap();

        assert!(binder.invalidate(&a).await);
        assert_eq!(counters.live.load(Ordering::SeqCst), 1);

        binder.close_all().await;
        assert_eq!(counters.live.load(Ordering::SeqCst), 0);
        assert!(binder.is_empty());
    }
}
