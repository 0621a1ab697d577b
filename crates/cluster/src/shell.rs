//! Remote shell abstraction shared by the BMC and node layers.

use std::{path::Path, time::Duration};

use {async_trait::async_trait, tokio_util::sync::CancellationToken};

use crate::error::{Error, Result};

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// `Ok(self)` on exit 0, otherwise [`Error::CommandFailed`].
    pub fn checked(self, command: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        Err(Error::command_failed(command, self.exit_code, detail))
    }
}

/// One turn of an interactive dialog: wait for `expect` to appear in the
/// output, then type `send` followed by a newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectStep {
    pub expect: String,
    pub send: String,
}

impl ExpectStep {
    #[must_use]
    pub fn new(expect: impl Into<String>, send: impl Into<String>) -> Self {
        Self {
            expect: expect.into(),
            send: send.into(),
        }
    }
}

/// Command channel to a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Human-readable target, e.g. `root@turingpi.local:22`.
    fn target(&self) -> String;

    async fn exec(&self, command: &str, cancel: &CancellationToken) -> Result<ShellOutput>;

    /// Drive an interactive session through `steps`. `timeout` bounds each
    /// wait for an expected string. Returns the full transcript.
    async fn expect_send(
        &self,
        steps: &[ExpectStep],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String>;

    async fn upload(&self, local: &Path, remote: &str, cancel: &CancellationToken) -> Result<()>;

    async fn download(&self, remote: &str, local: &Path, cancel: &CancellationToken)
    -> Result<()>;
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c)
}

/// Quote one word for a POSIX shell on the far side.
#[must_use]
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_plain) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Join words into a single command line, quoting where needed.
#[must_use]
pub fn command_line<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("tpi", "tpi")]
    #[case("/tmp/rk1.img", "/tmp/rk1.img")]
    #[case("", "''")]
    #[case("hello world", "'hello world'")]
    #[case("it's", r"'it'\''s'")]
    #[case("$(reboot)", "'$(reboot)'")]
    fn quoting(#[case] word: &str, #[case] quoted: &str) {
        assert_eq!(quote(word), quoted);
    }

    #[test]
    fn command_line_joins_words() {
        assert_eq!(
            command_line(&["tpi", "uart", "-n", "2", "set", "--cmd", "uname -a"]),
            "tpi uart -n 2 set --cmd 'uname -a'"
        );
    }

    #[test]
    fn checked_prefers_stderr() {
        let out = ShellOutput {
            stdout: "ignored".into(),
            stderr: "no such node".into(),
            exit_code: 3,
        };
        let err = out.checked("tpi power on -n 9").unwrap_err();
        assert_eq!(err.to_string(), "`tpi power on -n 9` exited with 3: no such node");
    }

    #[test]
    fn checked_falls_back_to_stdout() {
        let out = ShellOutput {
            stdout: "error: busy".into(),
            stderr: "  ".into(),
            exit_code: 1,
        };
        assert!(out.checked("tpi reboot").unwrap_err().to_string().ends_with("error: busy"));
        assert!(ShellOutput::default().checked("true").is_ok());
    }
}
