//! Process-wide tracking of every container this process created.
//!
//! Anything registered here is destroyed on clean close, on `sweep()`, or by
//! the signal handler installed on first use of [`ContainerRegistry::global`].

use std::{
    collections::BTreeSet,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    futures::{FutureExt, future::join_all},
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    cli::DockerCli,
    reaper::{ApiReaper, CliReaper, Reaper},
};

type CleanupHook = Box<dyn FnOnce() + Send>;

/// Deadlines applied while destroying containers.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub stop_grace: Duration,
    pub per_container: Duration,
    pub sweep: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            per_container: Duration::from_secs(30),
            sweep: Duration::from_secs(120),
        }
    }
}

/// Outcome of a sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    /// A panic escaped a cleanup task and was contained.
    pub panicked: bool,
}

pub struct ContainerRegistry {
    tracked: Mutex<BTreeSet<String>>,
    /// Tried in order: the first is the primary, the rest are fallbacks.
    reapers: Vec<Arc<dyn Reaper>>,
    deadlines: Deadlines,
    shutdown: CancellationToken,
    hook: Mutex<Option<CleanupHook>>,
    fallback_cli: DockerCli,
    active_runs: AtomicUsize,
    runs_done: Notify,
}

/// Marks a workflow that owns containers of this registry as in flight.
/// Dropping it, normally after the workflow released everything it
/// acquired, lets a pending [`ContainerRegistry::drain_runs`] finish.
#[must_use = "the run counts as active only while the guard lives"]
pub struct ActiveRun {
    registry: Arc<ContainerRegistry>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if self.registry.active_runs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.registry.runs_done.notify_waiters();
        }
    }
}

static GLOBAL: OnceLock<Arc<ContainerRegistry>> = OnceLock::new();

impl ContainerRegistry {
    #[must_use]
    pub fn new(reapers: Vec<Arc<dyn Reaper>>, deadlines: Deadlines) -> Self {
        Self {
            tracked: Mutex::new(BTreeSet::new()),
            reapers,
            deadlines,
            shutdown: CancellationToken::new(),
            hook: Mutex::new(None),
            fallback_cli: DockerCli::default(),
            active_runs: AtomicUsize::new(0),
            runs_done: Notify::new(),
        }
    }

    /// API reaper first (when a local client can be configured), then the CLI.
    #[must_use]
    pub fn with_default_reapers(deadlines: Deadlines) -> Self {
        let mut reapers: Vec<Arc<dyn Reaper>> = Vec::with_capacity(2);
        match bollard::Docker::connect_with_local_defaults() {
            Ok(docker) => reapers.push(Arc::new(ApiReaper::new(docker))),
            Err(e) => debug!(error = %e, "no API client for the registry, using CLI only"),
        }
        reapers.push(Arc::new(CliReaper::default()));
        Self::new(reapers, deadlines)
    }

    /// The process-wide registry. The first call installs signal handlers.
    pub fn global() -> Arc<Self> {
        Self::init_global(Deadlines::default())
    }

    /// Like [`Self::global`], but the first caller picks the deadlines. Later
    /// calls get the existing registry unchanged.
    pub fn init_global(deadlines: Deadlines) -> Arc<Self> {
        let registry = Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::with_default_reapers(deadlines))));
        crate::signal::ensure_installed(&registry);
        registry
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, id: &str) {
        if self.tracked().insert(id.to_string()) {
            debug!(container = %id, "registered container");
        }
    }

    pub fn unregister(&self, id: &str) {
        if self.tracked().remove(id) {
            debug!(container = %id, "unregistered container");
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.tracked().len()
    }

    #[must_use]
    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked().contains(id)
    }

    /// Token cancelled when a termination signal arrives.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[must_use]
    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    /// Count a workflow as active until the returned guard is dropped.
    pub fn begin_run(self: &Arc<Self>) -> ActiveRun {
        self.active_runs.fetch_add(1, Ordering::AcqRel);
        ActiveRun {
            registry: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.active_runs.load(Ordering::Acquire)
    }

    /// Wait until every [`ActiveRun`] is dropped, at most `limit`. Returns
    /// whether the runs finished in time.
    pub async fn drain_runs(&self, limit: Duration) -> bool {
        let drained = tokio::time::timeout(limit, async {
            loop {
                let notified = self.runs_done.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_runs() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                active = self.active_runs(),
                timeout_secs = limit.as_secs(),
                "active runs did not finish releasing in time"
            );
        }
        drained
    }

    /// Hook run once, after the next sweep completes (or panics).
    pub fn set_cleanup_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    /// Stop and remove every tracked container.
    ///
    /// Failures are logged and reported, never returned as errors. Every
    /// snapshotted entry is untracked afterwards regardless of outcome.
    pub async fn sweep(&self) -> SweepReport {
        let snapshot: Vec<String> = self.tracked().iter().cloned().collect();

        let mut report = if snapshot.is_empty() {
            SweepReport::default()
        } else {
            info!(count = snapshot.len(), "sweeping tracked containers");
            match AssertUnwindSafe(self.sweep_ids(&snapshot))
                .catch_unwind()
                .await
            {
                Ok(report) => report,
                Err(_) => {
                    warn!("container sweep panicked; remaining entries dropped");
                    SweepReport {
                        removed: Vec::new(),
                        failed: snapshot.clone(),
                        panicked: true,
                    }
                },
            }
        };

        {
            let mut tracked = self.tracked();
            for id in &snapshot {
                tracked.remove(id);
            }
        }

        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hook) = hook
            && std::panic::catch_unwind(AssertUnwindSafe(hook)).is_err()
        {
            warn!("container cleanup hook panicked");
            report.panicked = true;
        }

        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "some containers could not be removed");
        }
        report
    }

    async fn sweep_ids(&self, ids: &[String]) -> SweepReport {
        let tasks = ids.iter().map(|id| async move {
            let ok = match tokio::time::timeout(self.deadlines.per_container, self.reap(id)).await
            {
                Ok(ok) => ok,
                Err(_) => {
                    warn!(container = %id, "container cleanup timed out");
                    false
                },
            };
            (id.clone(), ok)
        });

        let mut report = SweepReport::default();
        match tokio::time::timeout(self.deadlines.sweep, join_all(tasks)).await {
            Ok(results) => {
                for (id, ok) in results {
                    if ok {
                        report.removed.push(id);
                    } else {
                        report.failed.push(id);
                    }
                }
            },
            Err(_) => {
                warn!(
                    timeout_secs = self.deadlines.sweep.as_secs(),
                    "container sweep hit its overall deadline"
                );
                report.failed = ids.to_vec();
            },
        }
        report
    }

    /// Stop then force-remove through each reaper until one confirms absence.
    async fn reap(&self, id: &str) -> bool {
        for reaper in &self.reapers {
            if let Err(e) = reaper.stop(id, self.deadlines.stop_grace).await {
                debug!(container = %id, reaper = reaper.name(), error = %e, "stop failed, removing anyway");
            }
            if let Err(e) = reaper.remove(id).await {
                warn!(container = %id, reaper = reaper.name(), error = %e, "remove failed");
                continue;
            }
            match reaper.exists(id).await {
                Ok(false) => {
                    debug!(container = %id, reaper = reaper.name(), "container removed");
                    return true;
                },
                Ok(true) => {
                    warn!(container = %id, reaper = reaper.name(), "container still present after remove");
                },
                Err(e) => {
                    warn!(container = %id, reaper = reaper.name(), error = %e, "could not verify removal");
                },
            }
        }
        false
    }

    /// Confirm a container is gone. A failed verification is logged and does
    /// not re-add the entry.
    pub async fn verify_removed(&self, id: &str) -> bool {
        for reaper in &self.reapers {
            match reaper.exists(id).await {
                Ok(false) => return true,
                Ok(true) => {
                    warn!(container = %id, reaper = reaper.name(), "container still exists");
                    return false;
                },
                Err(e) => {
                    debug!(container = %id, reaper = reaper.name(), error = %e, "verification failed, trying next");
                },
            }
        }
        warn!(container = %id, "could not verify container removal");
        false
    }

    /// Sweep whatever is left. The registry stays usable afterwards.
    pub async fn close(&self) -> SweepReport {
        let report = self.sweep().await;
        debug!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "container registry closed"
        );
        report
    }
}

impl Drop for ContainerRegistry {
    fn drop(&mut self) {
        let survivors: Vec<String> = self.tracked().iter().cloned().collect();
        if survivors.is_empty() {
            return;
        }
        warn!(
            count = survivors.len(),
            "container registry dropped with live containers; force-removing"
        );
        for id in survivors {
            let status = std::process::Command::new(self.fallback_cli.binary())
                .args(["rm", "-f", &id])
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
            if !status.is_ok_and(|s| s.success()) {
                warn!(container = %id, "finalizer could not remove container");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::error::{Error, Result},
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    /// In-memory daemon: containers listed in `live` exist until removed.
    #[derive(Default)]
    struct FakeReaper {
        live: Mutex<BTreeSet<String>>,
        fail_remove: bool,
        hang: bool,
        removes: AtomicUsize,
    }

    impl FakeReaper {
        fn with(ids: &[&str]) -> Self {
            Self {
                live: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Reaper for FakeReaper {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_remove {
                return Err(Error::lifecycle("remove", id, "daemon said no"));
            }
            self.live.lock().unwrap().remove(id);
            Ok(())
        }

        async fn exists(&self, id: &str) -> Result<bool> {
            Ok(self.live.lock().unwrap().contains(id))
        }
    }

    fn registry(reapers: Vec<Arc<dyn Reaper>>) -> ContainerRegistry {
        ContainerRegistry::new(reapers, Deadlines {
            stop_grace: Duration::from_secs(1),
            per_container: Duration::from_millis(200),
            sweep: Duration::from_secs(2),
        })
    }

    #[test]
    fn register_is_idempotent() {
        let reg = registry(vec![]);
        reg.register("a");
        reg.register("a");
        reg.register("b");
        assert_eq!(reg.count(), 2);
        reg.unregister("a");
        reg.unregister("a");
        assert_eq!(reg.count(), 1);
        reg.unregister("b");
    }

    #[tokio::test]
    async fn sweep_removes_everything_tracked() {
        let fake = Arc::new(FakeReaper::with(&["a", "b", "c"]));
        let reg = registry(vec![fake.clone()]);
        for id in ["a", "b", "c"] {
            reg.register(id);
        }
        let report = reg.sweep().await;
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(reg.count(), 0);
        assert!(fake.live.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let primary = Arc::new(FakeReaper {
            fail_remove: true,
            ..FakeReaper::with(&["a"])
        });
        // The fallback sees the same daemon state through a second view.
        let fallback = Arc::new(FakeReaper::with(&["a"]));
        let reg = registry(vec![primary.clone(), fallback.clone()]);
        reg.register("a");
        let report = reg.sweep().await;
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(primary.removes.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_untracked_anyway() {
        let broken = Arc::new(FakeReaper {
            fail_remove: true,
            ..FakeReaper::with(&["x"])
        });
        let reg = registry(vec![broken]);
        reg.register("x");
        let report = reg.sweep().await;
        assert_eq!(report.failed, vec!["x".to_string()]);
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_container_deadline_bounds_hung_daemon() {
        let hung = Arc::new(FakeReaper {
            hang: true,
            ..FakeReaper::with(&["slow"])
        });
        let reg = registry(vec![hung]);
        reg.register("slow");
        let report = reg.sweep().await;
        assert_eq!(report.failed, vec!["slow".to_string()]);
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test]
    async fn hook_runs_exactly_once() {
        let reg = registry(vec![Arc::new(FakeReaper::default())]);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        reg.set_cleanup_hook(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        reg.sweep().await;
        reg.sweep().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct PanickingReaper;

    #[async_trait]
    impl Reaper for PanickingReaper {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            panic!("reaper exploded");
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn exists(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn panic_during_sweep_still_runs_hook() {
        let reg = registry(vec![Arc::new(PanickingReaper)]);
        reg.register("boom");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        reg.set_cleanup_hook(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let report = reg.sweep().await;
        assert!(report.panicked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test]
    async fn verify_removed_consults_fallback_on_error() {
        struct Erroring;

        #[async_trait]
        impl Reaper for Erroring {
            fn name(&self) -> &'static str {
                "erroring"
            }

            async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
                Ok(())
            }

            async fn remove(&self, _id: &str) -> Result<()> {
                Ok(())
            }

            async fn exists(&self, id: &str) -> Result<bool> {
                Err(Error::lifecycle("inspect", id, "socket closed"))
            }
        }

        let reg = registry(vec![Arc::new(Erroring), Arc::new(FakeReaper::default())]);
        assert!(reg.verify_removed("gone").await);

        let still_there = registry(vec![Arc::new(FakeReaper::with(&["here"]))]);
        assert!(!still_there.verify_removed("here").await);
        assert_eq!(still_there.count(), 0);
    }
}
