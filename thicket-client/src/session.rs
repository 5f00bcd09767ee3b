use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};

use crate::api::AuthToken;

/// Where the session token survives between runs
pub trait TokenStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<AuthToken>>;
    fn save(&self, token: &AuthToken) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> FileTokenStore {
        FileTokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> anyhow::Result<Option<AuthToken>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data).with_context(|| {
                format!("parsing session token file {:?}", self.path)
            })?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading session token file {:?}", self.path)),
        }
    }

    fn save(&self, token: &AuthToken) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating session directory {:?}", dir))?;
        }
        fs::write(&self.path, serde_json::to_vec(token)?)
            .with_context(|| format!("writing session token file {:?}", self.path))
    }

    fn clear(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e)
                .with_context(|| format!("removing session token file {:?}", self.path)),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryTokenStore(Mutex<Option<AuthToken>>);

impl MemoryTokenStore {
    pub fn new() -> MemoryTokenStore {
        MemoryTokenStore::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> anyhow::Result<Option<AuthToken>> {
        Ok(self.0.lock().clone())
    }

    fn save(&self, token: &AuthToken) -> anyhow::Result<()> {
        *self.0.lock() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        *self.0.lock() = None;
        Ok(())
    }
}

/// Authentication context, handed explicitly to whatever talks to the
/// backend
///
/// Created by `hydrate` from the persisted token, torn down by `logout` (or
/// by the gateway when the backend says the token expired).
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

struct SessionInner {
    token: RwLock<Option<AuthToken>>,
    store: Arc<dyn TokenStore>,
}

impl Session {
    pub fn hydrate(store: Arc<dyn TokenStore>) -> anyhow::Result<Session> {
        let token = store.load().context("loading persisted session")?;
        tracing::debug!(authenticated = token.is_some(), "hydrated session");
        Ok(Session(Arc::new(SessionInner {
            token: RwLock::new(token),
            store,
        })))
    }

    /// A session that is never persisted
    pub fn ephemeral(token: Option<AuthToken>) -> Session {
        Session(Arc::new(SessionInner {
            token: RwLock::new(token),
            store: Arc::new(MemoryTokenStore::new()),
        }))
    }

    pub fn token(&self) -> Option<AuthToken> {
        self.0.token.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.0.token.read().is_some()
    }

    pub fn login(&self, token: AuthToken) -> anyhow::Result<()> {
        self.0.store.save(&token).context("persisting session")?;
        *self.0.token.write() = Some(token);
        tracing::info!("logged in");
        Ok(())
    }

    pub fn logout(&self) -> anyhow::Result<()> {
        *self.0.token.write() = None;
        self.0.store.clear().context("clearing persisted session")?;
        tracing::info!("logged out");
        Ok(())
    }

    /// Teardown on an authentication failure reported by the backend
    pub(crate) fn expire(&self) {
        tracing::info!("session expired, clearing credentials");
        *self.0.token.write() = None;
        if let Err(err) = self.0.store.clear() {
            tracing::error!(?err, "failed to clear expired session");
        }
    }
}
