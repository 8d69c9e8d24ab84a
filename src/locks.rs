//! The file-lock registry (an external contract) and the coordinator
//! that drives it on behalf of a change.
//!
//! The registry is owned externally, so it's a trait; `InMemoryFileLockRegistry`
//! is a reference implementation good enough for tests and single-process
//! deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::LockError;

#[derive(Debug, Clone)]
pub struct Lock {
    pub path: String,
    pub holder: String,
    pub exclusive: bool,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub path: String,
    pub holder: String,
    pub exclusive: bool,
    pub ttl: Duration,
}

/// The externally-owned lock registry. The coordinator holds no locks of
/// its own while calling through this trait.
#[async_trait::async_trait]
pub trait FileLockRegistry: Send + Sync {
    async fn acquire(&self, req: AcquireRequest) -> Result<Lock, LockError>;
    async fn release(&self, path: &str, holder: &str) -> Result<(), LockError>;
    async fn renew(&self, path: &str, holder: &str, ttl: Duration) -> Result<(), LockError>;
    async fn check(&self, path: &str) -> Vec<Lock>;
}

/// Reference in-memory registry. Normalizes paths to an absolute-looking
/// form (leading `/`, no trailing slash) so two callers using `a/b` and
/// `/a/b/` are understood to mean the same path.
///
/// Cheaply `Clone` (an `Arc` handle around shared state) so a test or a
/// supervising process can hold a second handle to observe state
/// independently of whatever coordinator is driving it.
#[derive(Clone)]
pub struct InMemoryFileLockRegistry {
    locks: Arc<Mutex<HashMap<String, Lock>>>,
}

impl InMemoryFileLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn normalize(path: &str) -> String {
        let trimmed = path.trim_matches('/');
        format!("/{trimmed}")
    }
}

impl Default for InMemoryFileLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FileLockRegistry for InMemoryFileLockRegistry {
    async fn acquire(&self, req: AcquireRequest) -> Result<Lock, LockError> {
        let path = Self::normalize(&req.path);
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(&path) {
            let expired = existing.expires_at <= Instant::now();
            if !expired && existing.holder != req.holder {
                return Err(LockError::Conflict {
                    path,
                    holder: existing.holder.clone(),
                    exclusive: existing.exclusive,
                });
            }
        }
        let lock = Lock {
            path: path.clone(),
            holder: req.holder,
            exclusive: req.exclusive,
            expires_at: Instant::now() + req.ttl,
        };
        locks.insert(path, lock.clone());
        Ok(lock)
    }

    async fn release(&self, path: &str, holder: &str) -> Result<(), LockError> {
        let path = Self::normalize(path);
        let mut locks = self.locks.lock();
        // "Not held" and "not found" are both tolerated as success --
        // release must be idempotent.
        if let Some(existing) = locks.get(&path) {
            if existing.holder == holder {
                locks.remove(&path);
            }
        }
        Ok(())
    }

    async fn renew(&self, path: &str, holder: &str, ttl: Duration) -> Result<(), LockError> {
        let path = Self::normalize(path);
        let mut locks = self.locks.lock();
        match locks.get_mut(&path) {
            Some(existing) if existing.holder == holder => {
                existing.expires_at = Instant::now() + ttl;
                Ok(())
            }
            Some(_) => Err(LockError::NotHeld(path, holder.to_string())),
            None => Err(LockError::NotFound(path)),
        }
    }

    async fn check(&self, path: &str) -> Vec<Lock> {
        let path = Self::normalize(path);
        self.locks.lock().get(&path).cloned().into_iter().collect()
    }
}

/// Object-safe facade over `FileLockCoordinator<R>` so the coordinator can
/// hold one behind a trait object instead of threading `R` through every
/// generic parameter list.
#[async_trait::async_trait]
pub trait LockDriver: Send + Sync {
    async fn acquire_all(&self, holder: &str, paths: &[String], ttl: Duration) -> Result<Vec<Lock>, LockError>;
    async fn release_all(&self, holder: &str, paths: &[String]) -> Result<(), LockError>;

    /// Spawns a background task that renews `holder`'s locks on `paths`
    /// until `cancel` fires, keeping them alive for as long as the caller
    /// holds the token open rather than letting them lapse at `ttl`.
    fn spawn_renewal(self: Arc<Self>, holder: String, paths: Vec<String>, ttl: Duration, interval: Duration, cancel: CancellationToken);
}

/// Drives a `FileLockRegistry` on behalf of one Change: transactional
/// acquisition with rollback, background renewal, idempotent release.
pub struct FileLockCoordinator<R: FileLockRegistry> {
    registry: R,
}

impl<R: FileLockRegistry> FileLockCoordinator<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Acquires an exclusive lock with `ttl` for every path in `paths`.
    /// If any acquisition fails, every lock already acquired in this call
    /// is released before the error is returned -- no partial lock set is
    /// ever exposed to the caller.
    pub async fn acquire_all(&self, holder: &str, paths: &[String], ttl: Duration) -> Result<Vec<Lock>, LockError> {
        let mut acquired = Vec::new();
        for path in paths {
            match self
                .registry
                .acquire(AcquireRequest {
                    path: path.clone(),
                    holder: holder.to_string(),
                    exclusive: true,
                    ttl,
                })
                .await
            {
                Ok(lock) => acquired.push(lock),
                Err(e) => {
                    for lock in &acquired {
                        // Rollback best-effort: log but don't let a release
                        // failure mask the original acquisition error.
                        if let Err(release_err) = self.registry.release(&lock.path, holder).await {
                            warn!("rollback release of {} for {holder} failed: {release_err}", lock.path);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    pub async fn release_all(&self, holder: &str, paths: &[String]) -> Result<(), LockError> {
        for path in paths {
            self.registry.release(path, holder).await?;
        }
        Ok(())
    }

    pub async fn conflicts(&self, a_paths: &[String], b_paths: &[String]) -> bool {
        for pa in a_paths {
            for pb in b_paths {
                if InMemoryFileLockRegistry::normalize(pa) == InMemoryFileLockRegistry::normalize(pb) {
                    return true;
                }
            }
        }
        false
    }

    /// Spawns a background task that renews every lock in `paths` for
    /// `holder` at `min(interval, ttl/3)` until `cancel` fires. Renewal
    /// failure for one path logs and continues with the rest.
    pub fn spawn_renewal(self: Arc<Self>, holder: String, paths: Vec<String>, ttl: Duration, interval: Duration, cancel: CancellationToken)
    where
        R: 'static,
    {
        let renew_every = interval.min(ttl / 3);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(renew_every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        for path in &paths {
                            if let Err(e) = self.registry.renew(path, &holder, ttl).await {
                                warn!("failed to renew lock {path} for {holder}: {e}");
                            } else {
                                debug!("renewed lock {path} for {holder}");
                            }
                        }
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl<R: FileLockRegistry + 'static> LockDriver for FileLockCoordinator<R> {
    async fn acquire_all(&self, holder: &str, paths: &[String], ttl: Duration) -> Result<Vec<Lock>, LockError> {
        FileLockCoordinator::acquire_all(self, holder, paths, ttl).await
    }

    async fn release_all(&self, holder: &str, paths: &[String]) -> Result<(), LockError> {
        FileLockCoordinator::release_all(self, holder, paths).await
    }

    fn spawn_renewal(self: Arc<Self>, holder: String, paths: Vec<String>, ttl: Duration, interval: Duration, cancel: CancellationToken) {
        FileLockCoordinator::spawn_renewal(self, holder, paths, ttl, interval, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn acquire_then_release_then_acquire_succeeds() {
        let coord = FileLockCoordinator::new(InMemoryFileLockRegistry::new());
        let p = paths(&["/a", "/b"]);
        coord.acquire_all("holder1", &p, Duration::from_secs(60)).await.unwrap();
        coord.release_all("holder1", &p).await.unwrap();
        coord.acquire_all("holder1", &p, Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn conflict_rolls_back_earlier_acquisitions() {
        let registry = InMemoryFileLockRegistry::new();
        // Pre-take /b with a different holder so the second acquisition in
        // the transaction fails.
        registry
            .acquire(AcquireRequest {
                path: "/b".into(),
                holder: "other".into(),
                exclusive: true,
                ttl: Duration::from_secs(60),
            })
            .await
            .unwrap();
        let coord = FileLockCoordinator::new(registry);
        let p = paths(&["/a", "/b"]);
        let result = coord.acquire_all("holder1", &p, Duration::from_secs(60)).await;
        assert!(result.is_err());
        // /a must not be held afterward.
        assert!(coord.registry.check("/a").await.is_empty());
    }

    #[tokio::test]
    async fn release_is_idempotent_for_missing_locks() {
        let coord = FileLockCoordinator::new(InMemoryFileLockRegistry::new());
        coord.release_all("nobody", &paths(&["/never-held"])).await.unwrap();
    }

    #[tokio::test]
    async fn renewal_keeps_lock_alive_past_original_ttl() {
        let registry = InMemoryFileLockRegistry::new();
        let coord = Arc::new(FileLockCoordinator::new(registry.clone()));
        let ttl = Duration::from_millis(150);
        let p = paths(&["/renewed"]);
        coord.acquire_all("holder1", &p, ttl).await.unwrap();
        let cancel = CancellationToken::new();
        coord.clone().spawn_renewal("holder1".into(), p.clone(), ttl, Duration::from_millis(40), cancel.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        // Original TTL (150ms) would have expired; renewal should have kept
        // it alive, so a competing holder should still conflict.
        let conflict = registry
            .acquire(AcquireRequest {
                path: "/renewed".into(),
                holder: "other".into(),
                exclusive: true,
                ttl: Duration::from_secs(1),
            })
            .await;
        assert!(conflict.is_err());
    }
}
