//! Thin async wrapper over the `docker` CLI, used as the fallback path when
//! the API client fails and for operations the API has no stream-free form
//! of (`cp`, `build`).

use std::process::Stdio;

use tracing::debug;

use crate::error::{Error, Result, tail};

pub const DOCKER_CLI: &str = "docker";

#[derive(Debug, Clone)]
pub struct CliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CliOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: DOCKER_CLI.into(),
        }
    }
}

impl DockerCli {
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Whether the binary is on PATH and runs.
    #[must_use]
    pub fn is_available(&self) -> bool {
        is_cli_available(&self.binary)
    }

    /// Whether the CLI can reach a daemon with its own configuration.
    #[must_use]
    pub fn daemon_reachable(&self) -> bool {
        std::process::Command::new(&self.binary)
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    /// Run the CLI and capture its output; a non-zero exit is not an error here.
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<CliOutput> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        debug!(cli = %self.binary, args = ?args, "running container CLI");
        let output = tokio::process::Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run the CLI and return stdout, failing on a non-zero exit.
    pub async fn run_checked<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let output = self.run(args).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        let verb = args.first().map(|a| a.as_ref()).unwrap_or("");
        Err(Error::Message(format!(
            "{} {verb} failed ({}): {}",
            self.binary,
            output.exit_code,
            tail(&output.stderr)
        )))
    }

    /// Endpoint of the named context, or of the CLI's current context.
    pub async fn context_host(&self, context: Option<&str>) -> Option<String> {
        let name = match context {
            Some(name) => name.to_string(),
            None => self
                .run_checked(&["context", "show"])
                .await
                .ok()?
                .trim()
                .to_string(),
        };
        if name.is_empty() {
            return None;
        }
        let host = self
            .run_checked(&[
                "context",
                "inspect",
                "--format",
                "{{.Endpoints.docker.Host}}",
                name.as_str(),
            ])
            .await
            .ok()?;
        let host = host.trim();
        (!host.is_empty()).then(|| host.to_string())
    }
}

/// Check whether a CLI tool is available on PATH.
#[must_use]
pub fn is_cli_available(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
