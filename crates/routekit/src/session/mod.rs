//! Browsing session capability.
//!
//! - `BrowsingSession` - what the host session must provide
//! - `SessionScope` - scoped acquisition with guaranteed teardown
//! - `storage` - cookie jar persisted as the session's storage state

mod storage;

pub use storage::{CookieJar, StorageState, StoredCookie};

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A controlled browsing session that routes its requests through a
/// [`Dispatcher`](crate::Dispatcher).
#[async_trait]
pub trait BrowsingSession: Send + Sync {
    /// Start intercepting and open `url` (if any).
    async fn open(&self, url: Option<&str>) -> Result<()>;

    /// Resolves when the session ends on its own (last page closed).
    async fn closed(&self);

    /// Restore storage state saved by an earlier run.
    async fn load_storage_state(&self, path: &Path) -> Result<()>;

    async fn save_storage_state(&self, path: &Path) -> Result<()>;

    /// Release everything the session holds. Must be safe to call once on
    /// any exit path.
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Key for the storage-state file.
    pub name: String,
    /// Incognito sessions neither restore nor persist storage state.
    pub incognito: bool,
    pub start_url: Option<String>,
    pub state_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            incognito: true,
            start_url: None,
            state_dir: PathBuf::from(".auth"),
        }
    }
}

impl SessionOptions {
    pub fn storage_state_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.json", self.name))
    }
}

/// Owns a session for the duration of `run` and always tears it down.
///
/// Cancelling the token ends the run early. A cancelled run skips storage
/// persistence but still closes the session.
pub struct SessionScope<S: BrowsingSession> {
    session: Arc<S>,
    options: SessionOptions,
    cancel: CancellationToken,
}

impl<S: BrowsingSession> SessionScope<S> {
    pub fn new(session: Arc<S>, options: SessionOptions) -> Self {
        Self {
            session,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the run, e.g. from a signal handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// Open the session, run `body` alongside it, then tear down.
    ///
    /// The run ends when `body` finishes, the session closes itself, or the
    /// scope is cancelled, whichever comes first.
    pub async fn run<F, Fut>(self, body: F) -> Result<()>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let result = self.drive(body).await;
        let cancelled = self.cancel.is_cancelled();
        self.teardown(cancelled).await;
        result
    }

    async fn drive<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if !self.options.incognito {
            let path = self.options.storage_state_path();
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                self.session.load_storage_state(&path).await?;
                info!("Restored storage state from {}", path.display());
            }
        }

        self.session.open(self.options.start_url.as_deref()).await?;

        let session = self.session.clone();
        tokio::select! {
            result = body(session) => {
                result?;
                // a body that returns early still waits for the session to end
                tokio::select! {
                    _ = self.session.closed() => debug!("Session closed"),
                    _ = self.cancel.cancelled() => debug!("Session cancelled"),
                }
            }
            _ = self.session.closed() => debug!("Session closed"),
            _ = self.cancel.cancelled() => debug!("Session cancelled"),
        }
        Ok(())
    }

    async fn teardown(&self, cancelled: bool) {
        if !self.options.incognito && !cancelled {
            let path = self.options.storage_state_path();
            if let Err(e) = self.persist(&path).await {
                warn!("Failed to save storage state to {}: {}", path.display(), e);
            } else {
                info!("Saved storage state to {}", path.display());
            }
        }
        if let Err(e) = self.session.close().await {
            if e.is_session_closed() {
                debug!("Session already closed");
            } else {
                warn!("Failed to close session: {}", e);
            }
        }
    }

    async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.session.save_storage_state(path).await
    }
}
