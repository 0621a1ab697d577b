//! Stage primitives with one contract and two homes.
//!
//! [`HostBackend`] drives host tools directly and runs the xz codec
//! in-process. [`ContainerBackend`] runs everything inside a privileged
//! worker container, translating host paths through the container's mounts.
//! Callers always pass host paths for the workspace, mount point and output;
//! only [`ImageLocation::Container`] names a path that exists solely inside
//! the container.

use std::path::{Path, PathBuf};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    budget,
    checksum::FileChecksum,
    error::{Error, Result},
    location::ImageLocation,
    mutation::{self, MutationOp},
    partition::{PartitionTable, parse_mapping},
    runner::{CommandRunner, ContainerRunner, HostRunner, shell_quote},
    xz,
};

/// Scratch area inside the worker container for images the host cannot hold.
pub const CONTAINER_SCRATCH_DIR: &str = "/var/tmp/turingpi";

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decompress `source` into the workspace, or the container's own
    /// filesystem when the host lacks the space.
    async fn decompress(
        &self,
        source: &Path,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImageLocation>;

    /// Map the image's partitions and pick the root.
    async fn map_partitions(
        &self,
        image: &ImageLocation,
        cancel: &CancellationToken,
    ) -> Result<PartitionTable>;

    async fn unmap_partitions(&self, image: &ImageLocation, cancel: &CancellationToken)
    -> Result<()>;

    async fn mount(&self, device: &Path, mount_point: &Path, cancel: &CancellationToken)
    -> Result<()>;

    /// OS-level check that something is mounted at `mount_point`.
    async fn is_mounted(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<bool>;

    async fn unmount(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<()>;

    async fn dir_exists(&self, root: &Path, rel: &Path, cancel: &CancellationToken)
    -> Result<bool>;

    /// Entry names of `rel` under `root`, hidden ones included.
    async fn list_dir(
        &self,
        root: &Path,
        rel: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    async fn apply_mutations(
        &self,
        root: &Path,
        ops: &[MutationOp],
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileChecksum>>;

    /// Compress the image into the host path `dest`.
    async fn compress(
        &self,
        image: &ImageLocation,
        dest: &Path,
        level: u32,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Delete the decompressed image.
    async fn discard(&self, image: &ImageLocation, cancel: &CancellationToken) -> Result<()>;

    /// Release whatever the backend holds (the worker container).
    async fn close(&self) -> Result<()>;
}

/// `foo.img.xz` → `foo.img`.
pub fn decompressed_name(source: &Path) -> Result<String> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(".xz") {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => Err(Error::invalid(format!(
            "{} is not an .xz archive",
            source.display()
        ))),
    }
}

fn arg(path: &Path) -> String {
    path.display().to_string()
}

fn sv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| (*p).to_string()).collect()
}

async fn map_with(
    runner: &dyn CommandRunner,
    image: &Path,
    cancel: &CancellationToken,
) -> Result<PartitionTable> {
    let out = runner
        .run_checked(&[sv(&["kpartx", "-av"]), vec![arg(image)]].concat(), cancel)
        .await?;
    let table = parse_mapping(&out.stdout)?;
    info!(
        image = %image.display(),
        partitions = table.partitions.len(),
        root = %table.root_device().display(),
        "partitions mapped"
    );
    Ok(table)
}

async fn unmap_with(runner: &dyn CommandRunner, image: &Path, cancel: &CancellationToken) -> Result<()> {
    runner
        .run_checked(&[sv(&["kpartx", "-dv"]), vec![arg(image)]].concat(), cancel)
        .await?;
    debug!(image = %image.display(), "partitions unmapped");
    Ok(())
}

async fn mount_with(
    runner: &dyn CommandRunner,
    device: &Path,
    mount_point: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    runner
        .run_checked(&[String::from("mount"), arg(device), arg(mount_point)], cancel)
        .await?;
    debug!(device = %device.display(), mount_point = %mount_point.display(), "mounted");
    Ok(())
}

async fn unmount_with(runner: &dyn CommandRunner, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
    runner
        .run_checked(&[String::from("umount"), arg(mount_point)], cancel)
        .await?;
    debug!(mount_point = %mount_point.display(), "unmounted");
    Ok(())
}

async fn dir_exists_with(
    runner: &dyn CommandRunner,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<bool> {
    let out = runner
        .run(&[String::from("test"), "-d".into(), arg(path)], cancel)
        .await?;
    match out.exit_code {
        0 => Ok(true),
        1 => Ok(false),
        code => Err(Error::tool("test", code, &out.stderr)),
    }
}

async fn list_dir_with(
    runner: &dyn CommandRunner,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let out = runner
        .run_checked(&[String::from("ls"), "-1A".into(), arg(path)], cancel)
        .await?;
    Ok(out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Native tools on a Linux host.
pub struct HostBackend {
    runner: HostRunner,
}

impl HostBackend {
    #[must_use]
    pub fn new(runner: HostRunner) -> Self {
        Self { runner }
    }

    fn host_image(image: &ImageLocation) -> Result<&Path> {
        match image {
            ImageLocation::Host(p) => Ok(p),
            ImageLocation::Container(p) => Err(Error::invalid(format!(
                "{} lives inside a container; the host backend cannot reach it",
                p.display()
            ))),
        }
    }
}

#[async_trait]
impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn decompress(
        &self,
        source: &Path,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImageLocation> {
        let dest = workspace.join(decompressed_name(source)?);
        xz::decompress_file(source, &dest, cancel).await?;
        Ok(ImageLocation::Host(dest))
    }

    async fn map_partitions(
        &self,
        image: &ImageLocation,
        cancel: &CancellationToken,
    ) -> Result<PartitionTable> {
        map_with(&self.runner, Self::host_image(image)?, cancel).await
    }

    async fn unmap_partitions(&self, image: &ImageLocation, cancel: &CancellationToken) -> Result<()> {
        unmap_with(&self.runner, Self::host_image(image)?, cancel).await
    }

    async fn mount(&self, device: &Path, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        mount_with(&self.runner, device, mount_point, cancel).await
    }

    /// A mount point sits on a different device than its parent.
    async fn is_mounted(&self, mount_point: &Path, _cancel: &CancellationToken) -> Result<bool> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let Some(parent) = mount_point.parent() else {
                return Ok(true);
            };
            let here = match tokio::fs::metadata(mount_point).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            let above = tokio::fs::metadata(parent).await?;
            Ok(here.dev() != above.dev())
        }
        #[cfg(not(unix))]
        {
            let _ = mount_point;
            Ok(false)
        }
    }

    async fn unmount(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        unmount_with(&self.runner, mount_point, cancel).await
    }

    async fn dir_exists(&self, root: &Path, rel: &Path, cancel: &CancellationToken) -> Result<bool> {
        dir_exists_with(&self.runner, &mutation::resolve(root, rel)?, cancel).await
    }

    async fn list_dir(
        &self,
        root: &Path,
        rel: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        list_dir_with(&self.runner, &mutation::resolve(root, rel)?, cancel).await
    }

    async fn apply_mutations(
        &self,
        root: &Path,
        ops: &[MutationOp],
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileChecksum>> {
        mutation::apply_mutations(&self.runner, root, ops, verify, cancel).await
    }

    async fn compress(
        &self,
        image: &ImageLocation,
        dest: &Path,
        level: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        xz::compress_file(Self::host_image(image)?, dest, level, cancel).await?;
        Ok(())
    }

    async fn discard(&self, image: &ImageLocation, _cancel: &CancellationToken) -> Result<()> {
        match tokio::fs::remove_file(Self::host_image(image)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything through a privileged worker container.
pub struct ContainerBackend {
    runner: ContainerRunner,
    expansion_ratio: f64,
}

impl ContainerBackend {
    #[must_use]
    pub fn new(runner: ContainerRunner, expansion_ratio: f64) -> Self {
        Self {
            runner,
            expansion_ratio,
        }
    }

    /// Host path as seen from inside the container.
    fn inside(&self, host: &Path) -> Result<PathBuf> {
        self.runner
            .session()
            .spec()
            .container_path_for(host)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "{} is not visible inside container {}",
                    host.display(),
                    self.runner.session().name()
                ))
            })
    }

    fn image_path(&self, image: &ImageLocation) -> Result<PathBuf> {
        match image {
            ImageLocation::Host(p) => self.inside(p),
            ImageLocation::Container(p) => Ok(p.clone()),
        }
    }

    async fn shell(&self, snippet: String, cancel: &CancellationToken) -> Result<()> {
        self.runner
            .run_checked(&[String::from("sh"), "-c".into(), snippet], cancel)
            .await
            .map(|_| ())
    }

    /// Host free space decides whether the decompressed image may land in the
    /// bind-mounted workspace.
    async fn host_can_hold(&self, source: &Path, workspace: &Path) -> Result<bool> {
        let compressed = tokio::fs::metadata(source).await?.len();
        let workspace = workspace.to_path_buf();
        let free = tokio::task::spawn_blocking(move || budget::host_free_space(&workspace))
            .await
            .map_err(|e| Error::Message(format!("disk probe failed: {e}")))?;
        Ok(match free {
            Some(free) => budget::fits(compressed, self.expansion_ratio, free),
            None => {
                debug!("host free space unknown, assuming the workspace can hold the image");
                true
            },
        })
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn decompress(
        &self,
        source: &Path,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> Result<ImageLocation> {
        let name = decompressed_name(source)?;
        let src = self.inside(source)?;
        let (location, dest) = if self.host_can_hold(source, workspace).await? {
            let host = workspace.join(&name);
            let dest = self.inside(&host)?;
            (ImageLocation::Host(host), dest)
        } else {
            let scratch = Path::new(CONTAINER_SCRATCH_DIR).join(
                workspace
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "workspace".into()),
            );
            let dest = scratch.join(&name);
            warn!(
                image = %dest.display(),
                "host lacks space for the decompressed image; keeping it inside the container"
            );
            (ImageLocation::Container(dest.clone()), dest)
        };

        let parent = dest.parent().map(arg).unwrap_or_else(|| "/".into());
        let snippet = format!(
            "mkdir -p {} && xz -dc {} > {}",
            shell_quote(&parent),
            shell_quote(&arg(&src)),
            shell_quote(&arg(&dest)),
        );
        if let Err(e) = self.shell(snippet, cancel).await {
            let _ = self.shell(format!("rm -f {}", shell_quote(&arg(&dest))), &CancellationToken::new()).await;
            return Err(e);
        }
        debug!(location = %location, "decompressed in container");
        Ok(location)
    }

    async fn map_partitions(
        &self,
        image: &ImageLocation,
        cancel: &CancellationToken,
    ) -> Result<PartitionTable> {
        map_with(&self.runner, &self.image_path(image)?, cancel).await
    }

    async fn unmap_partitions(&self, image: &ImageLocation, cancel: &CancellationToken) -> Result<()> {
        unmap_with(&self.runner, &self.image_path(image)?, cancel).await
    }

    async fn mount(&self, device: &Path, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        let mp = self.inside(mount_point)?;
        self.runner
            .run_checked(&[String::from("mkdir"), "-p".into(), arg(&mp)], cancel)
            .await?;
        mount_with(&self.runner, device, &mp, cancel).await
    }

    async fn is_mounted(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<bool> {
        let mp = self.inside(mount_point)?;
        let out = self
            .runner
            .run(&[String::from("mountpoint"), "-q".into(), arg(&mp)], cancel)
            .await?;
        Ok(out.success())
    }

    async fn unmount(&self, mount_point: &Path, cancel: &CancellationToken) -> Result<()> {
        unmount_with(&self.runner, &self.inside(mount_point)?, cancel).await
    }

    async fn dir_exists(&self, root: &Path, rel: &Path, cancel: &CancellationToken) -> Result<bool> {
        let path = mutation::resolve(&self.inside(root)?, rel)?;
        dir_exists_with(&self.runner, &path, cancel).await
    }

    async fn list_dir(
        &self,
        root: &Path,
        rel: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let path = mutation::resolve(&self.inside(root)?, rel)?;
        list_dir_with(&self.runner, &path, cancel).await
    }

    async fn apply_mutations(
        &self,
        root: &Path,
        ops: &[MutationOp],
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileChecksum>> {
        mutation::apply_mutations(&self.runner, &self.inside(root)?, ops, verify, cancel).await
    }

    async fn compress(
        &self,
        image: &ImageLocation,
        dest: &Path,
        level: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if level > 9 {
            return Err(Error::invalid(format!("compression level {level} is out of range 0-9")));
        }
        let src = self.image_path(image)?;
        let out = self.inside(dest)?;
        self.shell(
            format!(
                "xz -T0 -{level} -c {} > {}",
                shell_quote(&arg(&src)),
                shell_quote(&arg(&out)),
            ),
            cancel,
        )
        .await
    }

    async fn discard(&self, image: &ImageLocation, cancel: &CancellationToken) -> Result<()> {
        let path = self.image_path(image)?;
        self.runner
            .run_checked(&[String::from("rm"), "-f".into(), arg(&path)], cancel)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.runner.session().close().await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("/images/ubuntu-22.04-rk1.img.xz", "ubuntu-22.04-rk1.img")]
    #[case("raspios.xz", "raspios")]
    fn decompressed_names(#[case] source: &str, #[case] want: &str) {
        assert_eq!(decompressed_name(Path::new(source)).unwrap(), want);
    }

    #[rstest]
    #[case("/images/disk.img")]
    #[case("/images/.xz")]
    #[case("/")]
    fn non_xz_sources_are_rejected(#[case] source: &str) {
        assert!(matches!(
            decompressed_name(Path::new(source)),
            Err(Error::InputInvalid(_))
        ));
    }

    #[tokio::test]
    async fn host_backend_refuses_container_locations() {
        let backend = HostBackend::new(HostRunner::new(false).unwrap());
        let err = backend
            .discard(
                &ImageLocation::Container("/var/tmp/turingpi/x.img".into()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InputInvalid(_)));
    }

    #[tokio::test]
    async fn host_decompress_of_corrupt_source_is_a_tool_failure() {
        let backend = HostBackend::new(HostRunner::new(false).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("broken.img.xz");
        std::fs::write(&source, b"\xfd7zXZ\0 but then garbage").unwrap();

        let err = backend
            .decompress(&source, dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), turingpi_common::ErrorKind::ToolFailure, "{err}");
        assert!(!dir.path().join("broken.img").exists());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn host_mount_check_compares_devices() {
        let backend = HostBackend::new(HostRunner::new(false).unwrap());
        let cancel = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("mnt");
        std::fs::create_dir(&plain).unwrap();
        assert!(!backend.is_mounted(&plain, &cancel).await.unwrap());
        assert!(!backend.is_mounted(&dir.path().join("absent"), &cancel).await.unwrap());
        assert!(backend.is_mounted(Path::new("/proc"), &cancel).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn host_dir_checks_and_listing() {
        let backend = HostBackend::new(HostRunner::new(false).unwrap());
        let cancel = CancellationToken::new();
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc/netplan")).unwrap();
        std::fs::write(root.path().join("etc/netplan/50-cloud-init.yaml"), "").unwrap();
        std::fs::write(root.path().join("etc/netplan/.hidden"), "").unwrap();

        assert!(backend.dir_exists(root.path(), Path::new("/etc/netplan"), &cancel).await.unwrap());
        assert!(!backend.dir_exists(root.path(), Path::new("etc/network"), &cancel).await.unwrap());
        let mut names = backend
            .list_dir(root.path(), Path::new("etc/netplan"), &cancel)
            .await
            .unwrap();
        names.sort();
        assert_eq!(names, [".hidden", "50-cloud-init.yaml"]);
    }
}
