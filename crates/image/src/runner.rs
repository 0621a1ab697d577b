//! Where privileged tooling commands actually run.
//!
//! [`HostRunner`] spawns them locally (through `sudo -n` when not root);
//! [`ContainerRunner`] executes them inside a [`ContainerSession`]. Both take
//! plain argv vectors; neither adds an implicit shell except where a batch is
//! explicitly joined for the container.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use {
    async_trait::async_trait,
    tokio::process::Command,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    turingpi_common::guarded,
    turingpi_container::ContainerSession,
};

use crate::error::{Error, Result};

/// Directory inside the worker container that holds staged payloads.
pub const CONTAINER_STAGING_DIR: &str = "/var/tmp/turingpi-stage";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Quote one argument for `sh -c`.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"/._-=:,+@%".contains(&b));
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join argv vectors into one `&&`-chained shell snippet.
#[must_use]
pub fn shell_snippet(commands: &[Vec<String>]) -> String {
    commands
        .iter()
        .map(|argv| {
            argv.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn tool_name(argv: &[String]) -> String {
    argv.first().cloned().unwrap_or_default()
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `argv` and report its output whatever the exit status.
    async fn run(&self, argv: &[String], cancel: &CancellationToken) -> Result<CommandOutput>;

    /// Run `argv`; a non-zero exit becomes [`Error::ToolFailure`].
    async fn run_checked(
        &self,
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let output = self.run(argv, cancel).await?;
        if output.success() {
            return Ok(output);
        }
        Err(Error::tool(tool_name(argv), output.exit_code, &output.stderr))
    }

    /// Run several commands, stopping at the first failure.
    async fn run_batch(&self, commands: &[Vec<String>], cancel: &CancellationToken) -> Result<()> {
        for argv in commands {
            self.run_checked(argv, cancel).await?;
        }
        Ok(())
    }

    /// Materialize `bytes` as a file the runner's commands can read.
    async fn stage_bytes(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<PathBuf>;

    /// Make a host file readable by the runner's commands.
    async fn stage_local(&self, src: &Path, cancel: &CancellationToken) -> Result<PathBuf>;

    /// Drop a path returned by one of the staging calls. Best effort.
    async fn discard_staged(&self, staged: &Path, cancel: &CancellationToken);
}

/// Runs tools on this machine.
pub struct HostRunner {
    elevate: bool,
    staging: tempfile::TempDir,
}

impl HostRunner {
    pub fn new(elevate: bool) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix("turingpi-stage-")
            .tempdir()?;
        Ok(Self { elevate, staging })
    }

    #[must_use]
    pub fn elevates(&self) -> bool {
        self.elevate
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = if self.elevate {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").args(argv);
            cmd
        } else {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn run(&self, argv: &[String], cancel: &CancellationToken) -> Result<CommandOutput> {
        if argv.is_empty() {
            return Err(Error::invalid("empty command"));
        }
        debug!(cmd = ?argv, elevate = self.elevate, "host exec");
        let mut cmd = self.command(argv);
        let output = guarded(cancel, None, cmd.output())
            .await?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::tool(tool_name(argv), 127, &format!("{}: not found", argv[0]))
                } else {
                    Error::Io(e)
                }
            })?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map_or(-1, i64::from),
        })
    }

    async fn stage_bytes(&self, bytes: &[u8], _cancel: &CancellationToken) -> Result<PathBuf> {
        let path = self
            .staging
            .path()
            .join(uuid::Uuid::new_v4().simple().to_string());
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    async fn stage_local(&self, src: &Path, _cancel: &CancellationToken) -> Result<PathBuf> {
        if !tokio::fs::try_exists(src).await? {
            return Err(Error::invalid(format!("{} does not exist", src.display())));
        }
        Ok(src.to_path_buf())
    }

    async fn discard_staged(&self, staged: &Path, _cancel: &CancellationToken) {
        if !staged.starts_with(self.staging.path()) {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(staged).await {
            debug!(path = %staged.display(), error = %e, "failed to discard staged file");
        }
    }
}

/// Runs tools inside a worker container.
pub struct ContainerRunner {
    session: Arc<ContainerSession>,
}

impl ContainerRunner {
    #[must_use]
    pub fn new(session: Arc<ContainerSession>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<ContainerSession> {
        &self.session
    }

    fn staged_path() -> PathBuf {
        Path::new(CONTAINER_STAGING_DIR).join(uuid::Uuid::new_v4().simple().to_string())
    }

    async fn ensure_staging_dir(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_checked(
            &["mkdir".into(), "-p".into(), CONTAINER_STAGING_DIR.into()],
            cancel,
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CommandRunner for ContainerRunner {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn run(&self, argv: &[String], cancel: &CancellationToken) -> Result<CommandOutput> {
        let out = self.session.exec_raw(argv, cancel).await?;
        Ok(CommandOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.exit_code,
        })
    }

    /// One `sh -c` per batch so a multi-step op costs a single exec.
    async fn run_batch(&self, commands: &[Vec<String>], cancel: &CancellationToken) -> Result<()> {
        match commands {
            [] => Ok(()),
            [single] => self.run_checked(single, cancel).await.map(|_| ()),
            _ => {
                let snippet = shell_snippet(commands);
                let argv = vec!["sh".to_string(), "-c".to_string(), snippet];
                let out = self.run(&argv, cancel).await?;
                if out.success() {
                    return Ok(());
                }
                Err(Error::tool(tool_name(&commands[0]), out.exit_code, &out.stderr))
            },
        }
    }

    async fn stage_bytes(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<PathBuf> {
        let local = tempfile::NamedTempFile::new()?;
        tokio::fs::write(local.path(), bytes).await?;
        self.stage_local(local.path(), cancel).await
    }

    async fn stage_local(&self, src: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
        self.ensure_staging_dir(cancel).await?;
        let staged = Self::staged_path();
        self.session.copy_in(src, &staged, cancel).await?;
        Ok(staged)
    }

    async fn discard_staged(&self, staged: &Path, cancel: &CancellationToken) {
        let argv = vec![
            "rm".to_string(),
            "-f".to_string(),
            staged.display().to_string(),
        ];
        if let Err(e) = self.run_checked(&argv, cancel).await {
            warn!(path = %staged.display(), error = %e, "failed to discard staged file");
        }
    }
}
