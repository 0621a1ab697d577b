//! Stop/remove/exists primitives used by the registry sweep and session close.

use std::time::Duration;

use {
    async_trait::async_trait,
    bollard::{
        Docker,
        errors::Error as BollardError,
        query_parameters::{
            InspectContainerOptions, RemoveContainerOptionsBuilder, StopContainerOptionsBuilder,
        },
    },
};

use crate::{
    cli::DockerCli,
    error::{Error, Result},
};

#[async_trait]
pub trait Reaper: Send + Sync {
    /// Human-readable name for logs ("api", "cli").
    fn name(&self) -> &'static str;

    /// Stop a container, waiting at most `grace` before the daemon kills it.
    async fn stop(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container and its anonymous volumes. Absent is success.
    async fn remove(&self, id: &str) -> Result<()>;

    async fn exists(&self, id: &str) -> Result<bool>;
}

pub(crate) fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

pub(crate) fn is_conflict(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 409,
            ..
        }
    )
}

/// Reaper backed by the daemon's HTTP API.
#[derive(Clone)]
pub struct ApiReaper {
    docker: Docker,
}

impl ApiReaper {
    #[must_use]
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl Reaper for ApiReaper {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let secs = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(id, Some(StopContainerOptionsBuilder::new().t(secs).build()))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::lifecycle("stop", id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .build(),
                ),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::lifecycle("remove", id, e)),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::lifecycle("inspect", id, e)),
        }
    }
}

/// Reaper shelling out to the container CLI.
#[derive(Debug, Clone, Default)]
pub struct CliReaper {
    cli: DockerCli,
}

impl CliReaper {
    #[must_use]
    pub fn new(cli: DockerCli) -> Self {
        Self { cli }
    }
}

fn cli_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("not found")
}

#[async_trait]
impl Reaper for CliReaper {
    fn name(&self) -> &'static str {
        "cli"
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        let out = self.cli.run(&["stop", "-t", secs.as_str(), id]).await?;
        if out.success() || cli_not_found(&out.stderr) {
            Ok(())
        } else {
            Err(Error::lifecycle("stop", id, out.stderr.trim()))
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let out = self.cli.run(&["rm", "-f", "-v", id]).await?;
        if out.success() || cli_not_found(&out.stderr) {
            Ok(())
        } else {
            Err(Error::lifecycle("remove", id, out.stderr.trim()))
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let out = self
            .cli
            .run(&["container", "inspect", "--format", "{{.Id}}", id])
            .await?;
        if out.success() {
            Ok(true)
        } else if cli_not_found(&out.stderr) {
            Ok(false)
        } else {
            Err(Error::lifecycle("inspect", id, out.stderr.trim()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("Error: No such container: abc123", true)]
    #[case("Error response from daemon: container abc not found", true)]
    #[case("Cannot connect to the Docker daemon", false)]
    fn cli_not_found_detection(#[case] stderr: &str, #[case] expected: bool) {
        assert_eq!(cli_not_found(stderr), expected);
    }

    #[test]
    fn status_classification() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        };
        assert!(is_not_found(&not_found));
        assert!(!is_not_found(&conflict));
        assert!(is_conflict(&conflict));
    }
}
