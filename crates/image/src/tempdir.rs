//! Scoped scratch directories with a background expiry sweeper.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex},
    time::{Duration, SystemTime},
};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::error::{Context, Error, Result};

const WRITE_CHECK_FILE: &str = ".turingpi-write-check";

#[derive(Debug, Clone, Copy)]
struct Entry {
    created: SystemTime,
    /// Owned by a running job until `cleanup` or `release`; never expired.
    held: bool,
}

struct State {
    base: Option<PathBuf>,
    /// Bases already created and checked for writability.
    ready: BTreeSet<PathBuf>,
    max_age: Duration,
    entries: BTreeMap<PathBuf, Entry>,
    sweeper: Option<CancellationToken>,
}

pub struct TempManager {
    state: Mutex<State>,
}

static GLOBAL: LazyLock<Arc<TempManager>> =
    LazyLock::new(|| Arc::new(TempManager::new(Duration::from_secs(6 * 60 * 60))));

impl TempManager {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                base: None,
                ready: BTreeSet::new(),
                max_age,
                entries: BTreeMap::new(),
                sweeper: None,
            }),
        }
    }

    /// Process-wide instance.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create `base` if needed and check that it is writable, once per base.
    async fn prepare_base(&self, base: &Path) -> Result<()> {
        if self.lock().ready.contains(base) {
            return Ok(());
        }
        tokio::fs::create_dir_all(base)
            .await
            .with_context(|| format!("create temp base {}", base.display()))?;
        let check = base.join(WRITE_CHECK_FILE);
        tokio::fs::write(&check, b"ok")
            .await
            .with_context(|| format!("temp base {} is not writable", base.display()))?;
        let _ = tokio::fs::remove_file(&check).await;
        self.lock().ready.insert(base.to_path_buf());
        Ok(())
    }

    /// Set the default base used by [`Self::create`]. Only the first call
    /// picks it; later calls are no-ops and leave it unchanged.
    pub async fn initialize(&self, base: &Path) -> Result<()> {
        if let Some(current) = self.base() {
            if current != base {
                debug!(
                    base = %current.display(),
                    requested = %base.display(),
                    "temp manager already initialized, keeping its base"
                );
            }
            return Ok(());
        }
        self.prepare_base(base).await?;
        let mut state = self.lock();
        if state.base.is_none() {
            debug!(base = %base.display(), "temp manager initialized");
            state.base = Some(base.to_path_buf());
        }
        Ok(())
    }

    #[must_use]
    pub fn base(&self) -> Option<PathBuf> {
        self.lock().base.clone()
    }

    pub fn set_max_age(&self, max_age: Duration) {
        self.lock().max_age = max_age;
    }

    async fn make(&self, base: &Path, prefix: &str, held: bool) -> Result<PathBuf> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let dir = base.join(format!("{prefix}{}", &token[..8]));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create workspace {}", dir.display()))?;
        self.lock().entries.insert(dir.clone(), Entry {
            created: SystemTime::now(),
            held,
        });
        debug!(dir = %dir.display(), held, "workspace created");
        Ok(dir)
    }

    /// Create `<base>/<prefix><token>` under the default base and track it.
    /// It is removed by the sweeper once older than the maximum age.
    pub async fn create(&self, prefix: &str) -> Result<PathBuf> {
        let base = self
            .base()
            .ok_or_else(|| Error::Message("temp manager is not initialized".into()))?;
        self.make(&base, prefix, false).await
    }

    /// Create `<base>/<prefix><token>` for a job with its own temp base. The
    /// directory is held until [`Self::cleanup`] or [`Self::release`], so the
    /// sweeper never touches it while the job runs.
    pub async fn create_in(&self, base: &Path, prefix: &str) -> Result<PathBuf> {
        self.prepare_base(base).await?;
        self.make(base, prefix, true).await
    }

    /// Remove a managed directory and stop tracking it.
    ///
    /// A directory with a file system still mounted directly below it is left
    /// in place and stays tracked.
    pub async fn cleanup(&self, dir: &Path) -> Result<()> {
        if !self.lock().entries.contains_key(dir) {
            debug!(dir = %dir.display(), "cleanup of untracked directory ignored");
            return Ok(());
        }
        if let Some(mount) = mounted_child(dir).await {
            return Err(Error::Message(format!(
                "{} is still a mount point, not removing {}",
                mount.display(),
                dir.display()
            )));
        }
        self.lock().entries.remove(dir);
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Stop tracking without deleting, for runs that keep their intermediates.
    pub fn release(&self, dir: &Path) {
        self.lock().entries.remove(dir);
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Remove entries older than the maximum age. Returns how many went.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<PathBuf> = {
            let state = self.lock();
            let now = SystemTime::now();
            state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.held
                        && now
                            .duration_since(entry.created)
                            .is_ok_and(|age| age >= state.max_age)
                })
                .map(|(dir, _)| dir.clone())
                .collect()
        };
        let mut removed = 0;
        for dir in expired {
            match self.cleanup(&dir).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove expired workspace"),
            }
        }
        if removed > 0 {
            info!(removed, "expired workspaces swept");
        }
        removed
    }

    /// Run [`Self::sweep_expired`] every `interval` until shutdown.
    /// Requires a tokio runtime; a second call is a no-op.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let token = {
            let mut state = self.lock();
            if state.sweeper.is_some() {
                return;
            }
            let token = CancellationToken::new();
            state.sweeper = Some(token.clone());
            token
        };
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_expired().await;
                    },
                }
            }
            debug!("temp sweeper stopped");
        });
    }

    /// Stop the sweeper and remove every managed directory.
    pub async fn shutdown(&self) {
        let (sweeper, dirs) = {
            let mut state = self.lock();
            (
                state.sweeper.take(),
                state.entries.keys().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(token) = sweeper {
            token.cancel();
        }
        for dir in dirs {
            if let Err(e) = self.cleanup(&dir).await {
                warn!(dir = %dir.display(), error = %e, "failed to remove workspace on shutdown");
            }
        }
    }
}

/// First directory directly below `dir` that lives on another device.
/// Workspaces mount the image root at `<workspace>/mnt`.
#[cfg(unix)]
async fn mounted_child(dir: &Path) -> Option<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let dev = tokio::fs::symlink_metadata(dir).await.ok()?.dev();
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = tokio::fs::symlink_metadata(entry.path()).await
            && meta.is_dir()
            && meta.dev() != dev
        {
            return Some(entry.path());
        }
    }
    None
}

#[cfg(not(unix))]
async fn mounted_child(_dir: &Path) -> Option<PathBuf> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_requires_initialize() {
        let manager = TempManager::new(Duration::from_secs(60));
        assert!(manager.create("ws-").await.is_err());
    }

    #[tokio::test]
    async fn create_and_cleanup() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::from_secs(60));
        manager.initialize(base.path()).await.unwrap();

        let dir = manager.create("node1-").await.unwrap();
        assert!(dir.is_dir());
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("node1-"));
        assert_eq!(manager.tracked_count(), 1);
        assert!(!base.path().join(WRITE_CHECK_FILE).exists());

        manager.cleanup(&dir).await.unwrap();
        assert!(!dir.exists());
        assert_eq!(manager.tracked_count(), 0);
    }

    #[tokio::test]
    async fn cleanup_leaves_untracked_paths_alone() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::from_secs(60));
        manager.initialize(base.path()).await.unwrap();
        let foreign = base.path().join("foreign");
        std::fs::create_dir(&foreign).unwrap();
        manager.cleanup(&foreign).await.unwrap();
        assert!(foreign.exists());
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::ZERO);
        manager.initialize(base.path()).await.unwrap();
        let a = manager.create("a-").await.unwrap();
        let b = manager.create("b-").await.unwrap();

        assert_eq!(manager.sweep_expired().await, 2);
        assert!(!a.exists() && !b.exists());
    }

    #[tokio::test]
    async fn fresh_entries_survive_sweep() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::from_secs(3600));
        manager.initialize(base.path()).await.unwrap();
        let dir = manager.create("keep-").await.unwrap();
        assert_eq!(manager.sweep_expired().await, 0);
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn shutdown_removes_everything() {
        let base = tempfile::tempdir().unwrap();
        let manager = Arc::new(TempManager::new(Duration::from_secs(3600)));
        manager.initialize(base.path()).await.unwrap();
        manager.start_sweeper(Duration::from_secs(300));
        let dirs = [
            manager.create("x-").await.unwrap(),
            manager.create("y-").await.unwrap(),
        ];
        manager.shutdown().await;
        assert_eq!(manager.tracked_count(), 0);
        assert!(dirs.iter().all(|d| !d.exists()));
    }

    #[tokio::test]
    async fn release_keeps_directory() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::ZERO);
        manager.initialize(base.path()).await.unwrap();
        let dir = manager.create("kept-").await.unwrap();
        manager.release(&dir);
        assert_eq!(manager.sweep_expired().await, 0);
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn initialize_is_one_shot() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::from_secs(60));
        manager.initialize(first.path()).await.unwrap();
        manager.initialize(second.path()).await.unwrap();

        assert_eq!(manager.base().as_deref(), Some(first.path()));
        let dir = manager.create("node1-").await.unwrap();
        assert!(dir.starts_with(first.path()));
    }

    #[tokio::test]
    async fn jobs_with_different_bases_get_their_own() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::from_secs(60));

        let ws_b = manager.create_in(b.path(), "nodeB-").await.unwrap();
        let ws_a = manager.create_in(a.path(), "nodeA-").await.unwrap();

        assert!(ws_a.starts_with(a.path()), "{}", ws_a.display());
        assert!(ws_b.starts_with(b.path()), "{}", ws_b.display());
        assert!(manager.base().is_none());
        assert_eq!(manager.tracked_count(), 2);
    }

    #[tokio::test]
    async fn unwritable_base_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        let manager = TempManager::new(Duration::from_secs(60));
        assert!(manager.create_in(&file, "ws-").await.is_err());
        assert_eq!(manager.tracked_count(), 0);
    }

    #[tokio::test]
    async fn held_workspaces_are_never_expired() {
        let base = tempfile::tempdir().unwrap();
        let manager = TempManager::new(Duration::ZERO);
        let running = manager.create_in(base.path(), "node2-").await.unwrap();
        std::fs::create_dir(running.join("mnt")).unwrap();

        assert_eq!(manager.sweep_expired().await, 0);
        assert!(running.join("mnt").exists());

        manager.cleanup(&running).await.unwrap();
        assert!(!running.exists());
        assert_eq!(manager.tracked_count(), 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn mount_below_is_detected() {
        assert_eq!(mounted_child(Path::new("/")).await.is_some(), Path::new("/proc").is_dir());
        let plain = tempfile::tempdir().unwrap();
        std::fs::create_dir(plain.path().join("mnt")).unwrap();
        assert!(mounted_child(plain.path()).await.is_none());
    }
}
