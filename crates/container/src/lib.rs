//! Managed worker containers.
//!
//! - [`registry`]: process-wide tracking with guaranteed cleanup on exit,
//!   panic, or termination signal
//! - [`session`]: create-or-attach a named long-lived container and run
//!   commands in it
//! - [`spec`]: declarative container description and mount layouts

pub mod cli;
pub mod endpoint;
pub mod error;
pub mod image;
pub mod reaper;
pub mod registry;
pub mod session;
pub mod signal;
pub mod spec;

pub use {
    cli::DockerCli,
    error::{DaemonHint, Error, Result},
    reaper::{ApiReaper, CliReaper, Reaper},
    registry::{ActiveRun, ContainerRegistry, Deadlines, SweepReport},
    session::{ContainerSession, ExecOutput, SessionOptions, SessionState},
    spec::{ContainerSpec, MANAGED_LABEL, Mount, PRIVILEGED_IMAGE},
};

/// Remove containers carrying the managed label that no registry tracks,
/// e.g. leftovers of a killed process. Returns the ids removed.
pub async fn prune_managed(cli: &DockerCli) -> Result<Vec<String>> {
    let filter = format!("label={MANAGED_LABEL}=true");
    let listed = cli
        .run_checked(&["ps", "-aq", "--filter", filter.as_str()])
        .await?;
    let ids: Vec<String> = listed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    let reaper = CliReaper::new(cli.clone());
    let mut removed = Vec::with_capacity(ids.len());
    for id in ids {
        match reaper.remove(&id).await {
            Ok(()) => removed.push(id),
            Err(e) => tracing::warn!(container = %id, error = %e, "failed to prune container"),
        }
    }
    Ok(removed)
}
