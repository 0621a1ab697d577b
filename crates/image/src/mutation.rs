//! Declarative file edits applied to a mounted image root.

use std::path::{Component, Path, PathBuf};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    checksum::{FileChecksum, sha256_bytes, sha256_file},
    error::{Error, Result},
    runner::CommandRunner,
};

/// One edit. Paths are relative to the image root; absolute paths are
/// re-rooted and `..` is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    Write {
        path: PathBuf,
        bytes: Vec<u8>,
        mode: u32,
    },
    CopyLocal {
        src: PathBuf,
        dst: PathBuf,
    },
    Mkdir {
        path: PathBuf,
        mode: u32,
    },
    Chmod {
        path: PathBuf,
        mode: u32,
    },
}

impl MutationOp {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::CopyLocal { .. } => "copy",
            Self::Mkdir { .. } => "mkdir",
            Self::Chmod { .. } => "chmod",
        }
    }

    /// Path inside the image the op targets.
    #[must_use]
    pub fn target(&self) -> &Path {
        match self {
            Self::Write { path, .. } | Self::Mkdir { path, .. } | Self::Chmod { path, .. } => path,
            Self::CopyLocal { dst, .. } => dst,
        }
    }
}

/// Collects ops in application order.
#[derive(Debug, Clone, Default)]
pub struct MutationPlanner {
    ops: Vec<MutationOp>,
}

impl MutationPlanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>, mode: u32) -> &mut Self {
        self.ops.push(MutationOp::Write {
            path: path.into(),
            bytes: bytes.into(),
            mode,
        });
        self
    }

    pub fn copy_local(&mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> &mut Self {
        self.ops.push(MutationOp::CopyLocal {
            src: src.into(),
            dst: dst.into(),
        });
        self
    }

    pub fn mkdir(&mut self, path: impl Into<PathBuf>, mode: u32) -> &mut Self {
        self.ops.push(MutationOp::Mkdir {
            path: path.into(),
            mode,
        });
        self
    }

    pub fn chmod(&mut self, path: impl Into<PathBuf>, mode: u32) -> &mut Self {
        self.ops.push(MutationOp::Chmod {
            path: path.into(),
            mode,
        });
        self
    }

    #[must_use]
    pub fn operations(&self) -> &[MutationOp] {
        &self.ops
    }

    #[must_use]
    pub fn into_operations(self) -> Vec<MutationOp> {
        self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Join an image-relative path onto `root`.
pub fn resolve(root: &Path, rel: &Path) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for component in rel.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {},
            Component::ParentDir => {
                return Err(Error::invalid(format!(
                    "{} escapes the image root",
                    rel.display()
                )));
            },
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            },
        }
    }
    if !pushed {
        return Err(Error::invalid(format!(
            "{:?} does not name a path inside the image",
            rel.display().to_string()
        )));
    }
    Ok(out)
}

/// `0o644` → `"644"`, the form `stat -c %a` prints.
#[must_use]
pub fn mode_string(mode: u32) -> String {
    format!("{:o}", mode & 0o7777)
}

fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

/// Permission bits of a local source file; `0o644` where they are unknown.
async fn local_mode(src: &Path) -> Result<u32> {
    let meta = tokio::fs::metadata(src).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(meta.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        Ok(0o644)
    }
}

/// Apply `ops` strictly in order. The first failure aborts with the op's
/// index and kind. With `verify` set every touched path is read back; written
/// files are returned with their checksums.
pub async fn apply_mutations(
    runner: &dyn CommandRunner,
    root: &Path,
    ops: &[MutationOp],
    verify: bool,
    cancel: &CancellationToken,
) -> Result<Vec<FileChecksum>> {
    let mut checksums = Vec::new();
    for (index, op) in ops.iter().enumerate() {
        let wrap = |source: Error| match source {
            Error::Interrupted(_) => source,
            other => Error::Mutation {
                index,
                kind: op.kind(),
                source: Box::new(other),
            },
        };
        let target = resolve(root, op.target()).map_err(wrap)?;
        debug!(index, kind = op.kind(), target = %target.display(), backend = runner.name(), "applying mutation");
        let expected = apply_one(runner, op, &target, cancel).await.map_err(wrap)?;
        if verify
            && let Some(sum) = verify_one(runner, &target, expected, cancel)
                .await
                .map_err(wrap)?
        {
            checksums.push(sum);
        }
    }
    info!(ops = ops.len(), verified = verify, backend = runner.name(), "mutations applied");
    Ok(checksums)
}

/// What a later read-back must find.
struct Expected {
    mode: u32,
    sha256: Option<String>,
}

async fn apply_one(
    runner: &dyn CommandRunner,
    op: &MutationOp,
    target: &Path,
    cancel: &CancellationToken,
) -> Result<Expected> {
    match op {
        MutationOp::Write { bytes, mode, .. } => {
            let staged = runner.stage_bytes(bytes, cancel).await?;
            let placed = runner
                .run_batch(&[install(&staged, target, *mode)], cancel)
                .await;
            runner.discard_staged(&staged, cancel).await;
            placed?;
            Ok(Expected {
                mode: *mode,
                sha256: Some(sha256_bytes(bytes)),
            })
        },
        MutationOp::CopyLocal { src, .. } => {
            let mode = local_mode(src).await?;
            let digest = sha256_file(src).await?;
            let staged = runner.stage_local(src, cancel).await?;
            let placed = runner
                .run_batch(&[install(&staged, target, mode)], cancel)
                .await;
            runner.discard_staged(&staged, cancel).await;
            placed?;
            Ok(Expected {
                mode,
                sha256: Some(digest),
            })
        },
        MutationOp::Mkdir { mode, .. } => {
            runner
                .run_batch(
                    &[
                        argv([String::from("mkdir"), "-p".into(), path_arg(target)]),
                        chmod(target, *mode),
                    ],
                    cancel,
                )
                .await?;
            Ok(Expected {
                mode: *mode,
                sha256: None,
            })
        },
        MutationOp::Chmod { mode, .. } => {
            runner.run_batch(&[chmod(target, *mode)], cancel).await?;
            Ok(Expected {
                mode: *mode,
                sha256: None,
            })
        },
    }
}

fn install(staged: &Path, target: &Path, mode: u32) -> Vec<String> {
    argv([
        "install".to_string(),
        "-D".to_string(),
        "-m".to_string(),
        mode_string(mode),
        path_arg(staged),
        path_arg(target),
    ])
}

fn chmod(target: &Path, mode: u32) -> Vec<String> {
    argv([String::from("chmod"), mode_string(mode), path_arg(target)])
}

async fn verify_one(
    runner: &dyn CommandRunner,
    target: &Path,
    expected: Expected,
    cancel: &CancellationToken,
) -> Result<Option<FileChecksum>> {
    let stat = runner
        .run_checked(&argv([String::from("stat"), "-c".into(), "%a %s %Y".into(), path_arg(target)]), cancel)
        .await?;
    let mut fields = stat.stdout.split_whitespace();
    let mode = fields.next().unwrap_or_default().to_string();
    let size = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let modified = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);

    let want_mode = mode_string(expected.mode);
    if mode != want_mode {
        return Err(Error::VerificationMismatch {
            path: target.to_path_buf(),
            expected: format!("mode {want_mode}"),
            actual: format!("mode {mode}"),
        });
    }

    let Some(want_sha) = expected.sha256 else {
        return Ok(None);
    };
    let summed = runner
        .run_checked(&argv([String::from("sha256sum"), path_arg(target)]), cancel)
        .await?;
    let actual = summed
        .stdout
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if actual != want_sha {
        return Err(Error::VerificationMismatch {
            path: target.to_path_buf(),
            expected: want_sha,
            actual,
        });
    }
    Ok(Some(FileChecksum {
        path: target.to_path_buf(),
        sha256: actual,
        size,
        modified,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("etc/hostname", "/mnt/etc/hostname")]
    #[case("/etc/hostname", "/mnt/etc/hostname")]
    #[case("./etc/./netplan/01.yaml", "/mnt/etc/netplan/01.yaml")]
    fn resolves_inside_root(#[case] rel: &str, #[case] want: &str) {
        assert_eq!(resolve(Path::new("/mnt"), Path::new(rel)).unwrap(), Path::new(want));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("etc/../../x")]
    #[case("/")]
    #[case("")]
    fn rejects_escapes_and_empty(#[case] rel: &str) {
        let err = resolve(Path::new("/mnt"), Path::new(rel)).unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)), "{err}");
    }

    #[test]
    fn planner_keeps_insertion_order() {
        let mut plan = MutationPlanner::new();
        plan.mkdir("/home/pi/.ssh", 0o700)
            .write("/home/pi/.ssh/authorized_keys", "ssh-ed25519 AAAA", 0o600)
            .copy_local("/tmp/motd", "/etc/motd")
            .chmod("/home/pi/.ssh", 0o700);
        let kinds: Vec<_> = plan.operations().iter().map(MutationOp::kind).collect();
        assert_eq!(kinds, ["mkdir", "write", "copy", "chmod"]);
        assert_eq!(plan.operations()[2].target(), Path::new("/etc/motd"));
        assert_eq!(plan.len(), 4);
    }

    #[rstest]
    #[case(0o600, "600")]
    #[case(0o644, "644")]
    #[case(0o100_755, "755")]
    #[case(0o4755, "4755")]
    fn modes_render_like_stat(#[case] mode: u32, #[case] want: &str) {
        assert_eq!(mode_string(mode), want);
    }

    #[test]
    fn install_command_shape() {
        let cmd = install(Path::new("/stage/abc"), Path::new("/mnt/etc/hostname"), 0o644);
        assert_eq!(cmd, ["install", "-D", "-m", "644", "/stage/abc", "/mnt/etc/hostname"]);
    }
}
