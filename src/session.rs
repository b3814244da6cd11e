/// session.rs – The authenticated session shared by the REST client and sockets.
///
/// One `Session` is created at startup and handed (cloned) to every component
/// that needs credentials. Token changes are written through to the
/// `TokenStore`; persistence failures are logged, never propagated, so the
/// in-memory session is always authoritative.
///
/// Every `establish` and `clear` bumps a generation counter. A silent token
/// refresh records the generation it started under and only commits if that
/// generation is still current, so a refresh racing a logout cannot
/// repopulate storage.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::models::{SessionSnapshot, TokenPair, User};
use crate::store::{TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_SNAPSHOT_KEY};

type UnauthenticatedHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct Credentials {
    user: Option<User>,
    access_token: Option<String>,
    refresh_token: Option<String>,
}

struct Inner {
    creds: RwLock<Credentials>,
    generation: AtomicU64,
    store: Arc<dyn TokenStore>,
    on_unauthenticated: RwLock<Option<UnauthenticatedHook>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("authenticated", &self.is_authenticated())
            .field("generation", &self.generation())
            .finish()
    }
}

impl Session {
    /// Empty, unauthenticated session backed by *store*.
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                creds: RwLock::new(Credentials::default()),
                generation: AtomicU64::new(0),
                store,
                on_unauthenticated: RwLock::new(None),
            }),
        }
    }

    /// Rebuild the session from persisted keys.
    ///
    /// The token keys are authoritative; the snapshot only contributes the
    /// user. A half-present token pair is discarded and storage wiped.
    pub fn restore(store: Arc<dyn TokenStore>) -> Self {
        let session = Self::new(store);
        let read = |key: &str| match session.inner.store.get(key) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to read {key} from session store: {e:#}");
                None
            }
        };

        let access = read(ACCESS_TOKEN_KEY);
        let refresh = read(REFRESH_TOKEN_KEY);
        let user = read(SESSION_SNAPSHOT_KEY)
            .and_then(|raw| serde_json::from_str::<SessionSnapshot>(&raw).ok())
            .and_then(|snap| snap.user);

        match (access, refresh) {
            (Some(access), Some(refresh)) => {
                {
                    let mut creds = session.write_creds();
                    creds.user = user;
                    creds.access_token = Some(access);
                    creds.refresh_token = Some(refresh);
                }
                session.inner.generation.fetch_add(1, Ordering::SeqCst);
                info!("Restored session from store");
            }
            (None, None) => debug!("No stored session"),
            _ => {
                warn!("Stored session is incomplete – discarding");
                if let Err(e) = session.inner.store.clear() {
                    warn!("Failed to wipe session store: {e:#}");
                }
            }
        }
        session
    }

    /// Register the callback fired when the session expires irrecoverably.
    pub fn set_on_unauthenticated<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_unauthenticated.write() {
            *slot = Some(Arc::new(hook));
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn access_token(&self) -> Option<String> {
        self.read_creds().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_creds().refresh_token.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.read_creds().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        let creds = self.read_creds();
        creds.access_token.is_some() && creds.refresh_token.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let creds = self.read_creds();
        SessionSnapshot::new(
            creds.user.clone(),
            creds.access_token.clone(),
            creds.refresh_token.clone(),
        )
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Start a new session after login or registration.
    pub fn establish(&self, user: Option<User>, tokens: TokenPair) {
        {
            let mut creds = self.write_creds();
            creds.user = user;
            creds.access_token = Some(tokens.access_token);
            creds.refresh_token = tokens.refresh_token;
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.persist(&creds);
        }
        info!("Session established");
    }

    /// Replace the user record without touching tokens (e.g. after `/users/me`).
    pub fn set_user(&self, user: User) {
        let mut creds = self.write_creds();
        if creds.access_token.is_none() {
            return;
        }
        creds.user = Some(user);
        self.persist(&creds);
    }

    /// Commit a silently refreshed token pair.
    ///
    /// Returns `false` (and changes nothing) when the session was cleared or
    /// re-established since `generation` was read.
    pub fn apply_refresh(&self, generation: u64, tokens: TokenPair) -> bool {
        let mut creds = self.write_creds();
        if self.inner.generation.load(Ordering::SeqCst) != generation
            || creds.access_token.is_none()
        {
            debug!("Dropping refreshed tokens for a stale session");
            return false;
        }
        creds.access_token = Some(tokens.access_token);
        if let Some(refresh) = tokens.refresh_token {
            creds.refresh_token = Some(refresh);
        }
        self.persist(&creds);
        true
    }

    /// Explicit logout: drop credentials and wipe storage.
    pub fn clear(&self) {
        {
            let mut creds = self.write_creds();
            *creds = Credentials::default();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.inner.store.clear() {
                warn!("Failed to wipe session store: {e:#}");
            }
        }
        info!("Session cleared");
    }

    /// Irrecoverable refresh failure: clear and notify the host.
    pub fn expire(&self) {
        warn!("Session expired – credentials cleared");
        self.clear();
        let hook = self
            .inner
            .on_unauthenticated
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Write *creds* through to storage. Called with the write lock held so
    /// storage never lags behind a concurrent `clear`.
    fn persist(&self, creds: &Credentials) {
        let snapshot = SessionSnapshot::new(
            creds.user.clone(),
            creds.access_token.clone(),
            creds.refresh_token.clone(),
        );
        let store = &self.inner.store;
        let result = (|| -> anyhow::Result<()> {
            match &snapshot.access_token {
                Some(t) => store.set(ACCESS_TOKEN_KEY, t)?,
                None => store.remove(ACCESS_TOKEN_KEY)?,
            }
            match &snapshot.refresh_token {
                Some(t) => store.set(REFRESH_TOKEN_KEY, t)?,
                None => store.remove(REFRESH_TOKEN_KEY)?,
            }
            store.set(SESSION_SNAPSHOT_KEY, &serde_json::to_string(&snapshot)?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Failed to persist session: {e:#}");
        }
    }

    fn read_creds(&self) -> std::sync::RwLockReadGuard<'_, Credentials> {
        self.inner
            .creds
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_creds(&self) -> std::sync::RwLockWriteGuard<'_, Credentials> {
        self.inner
            .creds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
