use std::{path::Path, time::Duration};

use {tokio_util::sync::CancellationToken, tracing::info};

use crate::{
    error::Result,
    retry::RetryPolicy,
    shell::{ExpectStep, RemoteShell, ShellOutput},
};

/// Shell access to one compute node. Transport failures are retried per the
/// policy; a command that runs and fails is returned as-is.
pub struct NodeShell<S> {
    shell: S,
    retry: RetryPolicy,
}

impl<S: RemoteShell> NodeShell<S> {
    pub fn new(shell: S, retry: RetryPolicy) -> Self {
        Self { shell, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }

    /// Run `command`; the exit status is left to the caller.
    pub async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ShellOutput> {
        self.retry
            .run("exec", cancel, || self.shell.exec(command, cancel))
            .await
    }

    /// Run `command` and fail on a non-zero exit.
    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<String> {
        Ok(self.exec(command, cancel).await?.checked(command)?.stdout)
    }

    pub async fn expect_send(
        &self,
        steps: &[ExpectStep],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.retry
            .run("expect", cancel, || self.shell.expect_send(steps, timeout, cancel))
            .await
    }

    pub async fn copy_to(&self, local: &Path, remote: &str, cancel: &CancellationToken) -> Result<()> {
        self.retry
            .run("upload", cancel, || self.shell.upload(local, remote, cancel))
            .await?;
        info!(target_host = %self.shell.target(), local = %local.display(), remote, "copied to node");
        Ok(())
    }

    pub async fn copy_from(&self, remote: &str, local: &Path, cancel: &CancellationToken) -> Result<()> {
        self.retry
            .run("download", cancel, || self.shell.download(remote, local, cancel))
            .await?;
        info!(target_host = %self.shell.target(), remote, local = %local.display(), "copied from node");
        Ok(())
    }
}
