//! Termination-signal handling for the process-wide registry.
//!
//! On SIGTERM, SIGINT or SIGHUP the registry's shutdown token is cancelled,
//! active runs get until the sweep deadline to unwind what they acquired,
//! tracked containers are swept, and the signal is re-raised with its default
//! disposition so the process exits the way the sender expects.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    futures::FutureExt,
    tracing::{debug, error, info, warn},
};

use crate::registry::{ContainerRegistry, SweepReport};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install handlers for `registry` once per process. Needs a running tokio
/// runtime; if there is none yet, installation is retried on the next call.
/// [`ContainerRegistry::global`] calls this itself.
pub fn ensure_installed(registry: &Arc<ContainerRegistry>) {
    if INSTALLED.load(Ordering::Acquire) {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("no tokio runtime yet, deferring signal handler installation");
        return;
    };
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    install(&handle, Arc::clone(registry), true);
}

#[cfg(unix)]
fn install(handle: &tokio::runtime::Handle, registry: Arc<ContainerRegistry>, reraise: bool) {
    use tokio::signal::unix::{SignalKind, signal};

    handle.spawn(async move {
        let (mut term, mut int, mut hup) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(t), Ok(i), Ok(h)) => (t, i, h),
            _ => {
                warn!("failed to install termination signal handlers");
                INSTALLED.store(false, Ordering::Release);
                return;
            },
        };
        debug!("container cleanup signal handlers installed");

        let signo = tokio::select! {
            _ = term.recv() => signal_hook::consts::SIGTERM,
            _ = int.recv() => signal_hook::consts::SIGINT,
            _ = hup.recv() => signal_hook::consts::SIGHUP,
        };
        handle_signal(&registry, signo, reraise).await;
    });
}

#[cfg(not(unix))]
fn install(handle: &tokio::runtime::Handle, registry: Arc<ContainerRegistry>, _reraise: bool) {
    handle.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle_signal(&registry, 2, false).await;
            std::process::exit(130);
        }
    });
}

/// Cancel, let active runs unwind, sweep, then optionally re-raise. Never
/// panics.
pub async fn handle_signal(registry: &ContainerRegistry, signo: i32, reraise: bool) -> SweepReport {
    info!(
        signal = signo,
        count = registry.count(),
        active_runs = registry.active_runs(),
        "termination signal received, cleaning up containers"
    );
    registry.shutdown_token().cancel();

    if registry.active_runs() > 0 {
        debug!("waiting for active runs to release their resources");
        registry.drain_runs(registry.deadlines().sweep).await;
    }

    let report = match AssertUnwindSafe(registry.sweep()).catch_unwind().await {
        Ok(report) => report,
        Err(_) => {
            error!("container sweep panicked inside the signal handler");
            SweepReport {
                panicked: true,
                ..SweepReport::default()
            }
        },
    };

    if reraise {
        reraise_default(signo);
    }
    report
}

#[cfg(unix)]
fn reraise_default(signo: i32) {
    if let Err(e) = signal_hook::low_level::emulate_default_handler(signo) {
        error!(signal = signo, error = %e, "failed to re-raise signal");
        std::process::exit(128 + signo);
    }
}

#[cfg(not(unix))]
fn reraise_default(signo: i32) {
    std::process::exit(128 + signo);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::{
            error::Result,
            reaper::Reaper,
            registry::Deadlines,
        },
        async_trait::async_trait,
        std::time::Duration,
    };

    struct Gone;

    #[async_trait]
    impl Reaper for Gone {
        fn name(&self) -> &'static str {
            "gone"
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn exists(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn signal_cancels_token_and_sweeps() {
        let registry = ContainerRegistry::new(vec![Arc::new(Gone)], Deadlines::default());
        let token = registry.shutdown_token();
        registry.register("worker-1");
        registry.register("worker-2");

        let report = handle_signal(&registry, signal_hook::consts::SIGTERM, false).await;

        assert!(token.is_cancelled());
        assert_eq!(report.removed.len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn active_runs_unwind_before_the_sweep() {
        let registry = Arc::new(ContainerRegistry::new(vec![Arc::new(Gone)], Deadlines::default()));
        registry.register("worker-1");
        let run = registry.begin_run();
        let token = registry.shutdown_token();
        let unwound = Arc::new(AtomicBool::new(false));

        let worker = {
            let registry = Arc::clone(&registry);
            let unwound = Arc::clone(&unwound);
            tokio::spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.unregister("worker-1");
                unwound.store(true, Ordering::SeqCst);
                drop(run);
            })
        };

        let report = handle_signal(&registry, signal_hook::consts::SIGINT, false).await;

        assert!(unwound.load(Ordering::SeqCst), "sweep ran before the run unwound");
        assert!(report.removed.is_empty(), "the run released its own container");
        assert_eq!(registry.active_runs(), 0);
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_run_is_abandoned_at_the_sweep_deadline() {
        let deadlines = Deadlines {
            sweep: Duration::from_secs(3),
            ..Deadlines::default()
        };
        let registry = Arc::new(ContainerRegistry::new(vec![Arc::new(Gone)], deadlines));
        registry.register("worker-1");
        let _stuck = registry.begin_run();

        let report = handle_signal(&registry, signal_hook::consts::SIGTERM, false).await;

        assert_eq!(report.removed, ["worker-1"]);
        assert_eq!(registry.active_runs(), 1);
    }
}
