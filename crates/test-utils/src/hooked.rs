use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use flockdag::coord::{
    CoordError, Coordinator, CreateMode, CreateOutcome, MemoryCoordinator, NodeStat, WatchHandle,
    WatchKind,
};

type Hook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A session that runs a one-shot hook right before creating a given path,
/// or a sequential node with a given prefix.
///
/// Used to land a concurrent write at an exact point of another operation.
pub struct HookedCoordinator {
    inner: MemoryCoordinator,
    path: String,
    hook: Mutex<Option<Hook>>,
}

impl std::fmt::Debug for HookedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookedCoordinator")
            .field("session", &self.inner.session_id())
            .field("path", &self.path)
            .field("fired", &self.fired())
            .finish()
    }
}

impl HookedCoordinator {
    pub fn before_create<F, Fut>(inner: MemoryCoordinator, path: impl Into<String>, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Hook = Box::new(move || -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(hook())
        });
        Self {
            inner,
            path: path.into(),
            hook: Mutex::new(Some(hook)),
        }
    }

    /// Whether the hook has run.
    pub fn fired(&self) -> bool {
        self.hook.lock().map(|h| h.is_none()).unwrap_or(true)
    }

    async fn run_hook(&self, path: &str) {
        if path != self.path {
            return;
        }
        let hook = self.hook.lock().ok().and_then(|mut h| h.take());
        if let Some(hook) = hook {
            hook().await;
        }
    }
}

#[async_trait]
impl Coordinator for HookedCoordinator {
    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<CreateOutcome, CoordError> {
        self.run_hook(path).await;
        self.inner.create(path, data, mode).await
    }

    async fn create_sequential(
        &self,
        prefix: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.run_hook(prefix).await;
        self.inner.create_sequential(prefix, data, mode).await
    }

    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.inner.exists(path).await
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        self.inner.get_data(path).await
    }

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>, CoordError> {
        self.inner.stat(path).await
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.inner.get_children(path).await
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.inner.delete(path).await
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> Result<WatchHandle, CoordError> {
        self.inner.watch(path, kind).await
    }

    async fn close(&self) -> Result<(), CoordError> {
        self.inner.close().await
    }
}
