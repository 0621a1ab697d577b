//! [`RemoteShell`] over the system OpenSSH client.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    async_trait::async_trait,
    tokio::process::Command,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    turingpi_common::guarded,
};

use crate::{
    error::{Context, Error, Result, tail},
    expect::converse,
    shell::{ExpectStep, RemoteShell, ShellOutput},
};

/// ssh reserves this exit status for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

const SESSION_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OpenSshShell {
    host: String,
    port: u16,
    user: String,
    identity: Option<PathBuf>,
    connect_timeout: Duration,
    /// Bound on a single exec or transfer; `None` waits forever.
    command_timeout: Option<Duration>,
}

impl OpenSshShell {
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            identity: None,
            connect_timeout: Duration::from_secs(10),
            command_timeout: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<PathBuf>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn common_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.identity {
            opts.push("-i".into());
            opts.push(identity.display().to_string());
        }
        opts
    }

    /// Arguments to `ssh`. With `tty` a terminal is forced so login prompts
    /// and shells behave interactively.
    #[must_use]
    pub fn ssh_args(&self, tty: bool, command: Option<&str>) -> Vec<String> {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        if tty {
            args.push("-tt".into());
        }
        args.extend(self.common_options());
        args.push(self.destination());
        if let Some(command) = command {
            args.push("--".into());
            args.push(command.to_string());
        }
        args
    }

    /// Arguments to `scp`; remote paths are given as `host:path`.
    #[must_use]
    pub fn scp_args(&self, from: &str, to: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string(), "-P".to_string(), self.port.to_string()];
        args.extend(self.common_options());
        args.push(from.to_string());
        args.push(to.to_string());
        args
    }

    fn remote(&self, path: &str) -> String {
        format!("{}:{path}", self.destination())
    }

    async fn output(&self, program: &str, args: Vec<String>, cancel: &CancellationToken) -> Result<ShellOutput> {
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = guarded(cancel, self.command_timeout, cmd.output())
            .await?
            .with_context(|| format!("spawning {program}"))?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn transfer(&self, from: String, to: String, cancel: &CancellationToken) -> Result<()> {
        let out = self.output("scp", self.scp_args(&from, &to), cancel).await?;
        if !out.success() {
            return Err(Error::transport(
                self.target(),
                format!("scp {from} -> {to} exited with {}: {}", out.exit_code, tail(&out.stderr)),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    fn target(&self) -> String {
        format!("{}:{}", self.destination(), self.port)
    }

    async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ShellOutput> {
        debug!(target_host = %self.target(), command, "ssh exec");
        let out = self
            .output("ssh", self.ssh_args(false, Some(command)), cancel)
            .await?;
        if out.exit_code == SSH_TRANSPORT_EXIT {
            return Err(Error::transport(self.target(), tail(&out.stderr)));
        }
        Ok(out)
    }

    async fn expect_send(
        &self,
        steps: &[ExpectStep],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut child = Command::new("ssh")
            .args(self.ssh_args(true, None))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("spawning ssh")?;
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::transport(self.target(), "ssh session has no stdio"));
        };

        let transcript = converse(&mut stdout, &mut stdin, steps, timeout, cancel).await?;
        drop(stdin);
        match tokio::time::timeout(SESSION_EXIT_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(target_host = %self.target(), %status, "interactive session ended");
            },
            Err(_) => {
                warn!(target_host = %self.target(), "interactive session did not exit, killing");
                child.kill().await?;
            },
        }
        Ok(transcript)
    }

    async fn upload(&self, local: &Path, remote: &str, cancel: &CancellationToken) -> Result<()> {
        self.transfer(local.display().to_string(), self.remote(remote), cancel)
            .await
    }

    async fn download(&self, remote: &str, local: &Path, cancel: &CancellationToken) -> Result<()> {
        self.transfer(self.remote(remote), local.display().to_string(), cancel)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn shell() -> OpenSshShell {
        OpenSshShell::new("turingpi.local", "root")
            .with_port(2222)
            .with_identity("/home/me/.ssh/id_ed25519")
    }

    #[test]
    fn exec_args_end_with_command() {
        let args = shell().ssh_args(false, Some("tpi power status"));
        assert_eq!(&args[..2], ["-p", "2222"]);
        assert!(!args.contains(&"-tt".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/me/.ssh/id_ed25519");
        assert_eq!(&args[args.len() - 3..], ["root@turingpi.local", "--", "tpi power status"]);
    }

    #[test]
    fn interactive_args_force_a_tty() {
        let args = OpenSshShell::new("10.0.0.11", "ubuntu").ssh_args(true, None);
        assert_eq!(args[2], "-tt");
        assert_eq!(args.last().unwrap(), "ubuntu@10.0.0.11");
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn scp_uses_capital_port_flag() {
        let s = shell();
        let args = s.scp_args("/tmp/fw.img", &s.remote("/tmp/fw.img"));
        assert_eq!(&args[..3], ["-q", "-P", "2222"]);
        assert_eq!(args.last().unwrap(), "root@turingpi.local:/tmp/fw.img");
        assert_eq!(s.target(), "root@turingpi.local:2222");
    }
}
