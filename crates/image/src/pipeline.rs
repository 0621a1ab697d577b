//! Turn a compressed OS image into a node-specific one.
//!
//! Stages run strictly in order. Every resource a stage acquires is pushed on
//! a release stack first; a failure or cancellation unwinds that stack in
//! reverse with a fresh token, so cleanup still runs after the caller's token
//! has fired. Release failures are logged and appended to the original error.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    tokio_util::sync::{CancellationToken, DropGuard},
    tracing::{debug, info, warn},
    turingpi_common::guarded,
    turingpi_container::ContainerRegistry,
};

use crate::{
    backend::Backend,
    checksum::{read_sidecar, sha256_file, sidecar_path, write_sidecar},
    error::{Error, ReleaseFailure, Result},
    executor::{BackendContext, BackendFactory, ContainerSettings, ExecutionMode, Executor},
    job::PreparationJob,
    location::ImageLocation,
    network,
    tempdir::TempManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    Workspace,
    Acquire,
    Decompress,
    Map,
    Mount,
    Network,
    Mutate,
    Unmount,
    Unmap,
    Compress,
    Finalize,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Workspace => "workspace",
            Self::Acquire => "acquire",
            Self::Decompress => "decompress",
            Self::Map => "map",
            Self::Mount => "mount",
            Self::Network => "network",
            Self::Mutate => "mutate",
            Self::Unmount => "unmount",
            Self::Unmap => "unmap",
            Self::Compress => "compress",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// xz preset, 0-9.
    pub compression_level: u32,
    /// Ceiling for each release step while unwinding.
    pub release_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression_level: 6,
            release_timeout: Duration::from_secs(60),
        }
    }
}

/// Something acquired during a run that must be given back.
#[derive(Debug)]
enum Held {
    Workspace(PathBuf),
    Backend,
    Image(ImageLocation),
    Mapping(ImageLocation),
    Mount(PathBuf),
    Partial(PathBuf),
}

impl Held {
    fn label(&self) -> String {
        match self {
            Self::Workspace(p) => format!("workspace {}", p.display()),
            Self::Backend => "backend".into(),
            Self::Image(loc) => format!("image {loc}"),
            Self::Mapping(loc) => format!("partition mapping of {loc}"),
            Self::Mount(p) => format!("mount {}", p.display()),
            Self::Partial(p) => format!("partial output {}", p.display()),
        }
    }
}

pub struct ImagePipeline {
    factory: Arc<dyn BackendFactory>,
    temp: Arc<TempManager>,
    config: PipelineConfig,
}

impl ImagePipeline {
    #[must_use]
    pub fn new(factory: Arc<dyn BackendFactory>, temp: Arc<TempManager>, config: PipelineConfig) -> Self {
        Self {
            factory,
            temp,
            config,
        }
    }

    /// Auto-selected backend, process-wide registry and temp manager.
    #[must_use]
    pub fn with_defaults() -> Self {
        let executor = Executor::new(
            ExecutionMode::Auto,
            ContainerSettings::default(),
            ContainerRegistry::global(),
            4.0,
        );
        Self::new(Arc::new(executor), TempManager::global(), PipelineConfig::default())
    }

    /// Prepare `job` and return the path of `<output>/<hostname>.img.xz`.
    ///
    /// An existing artefact is returned untouched. With checksum verification
    /// requested, an artefact whose `.sha256` sidecar disagrees is rebuilt.
    pub async fn prepare_image(&self, job: &PreparationJob, cancel: &CancellationToken) -> Result<PathBuf> {
        job.validate().map_err(|e| e.at_stage(Stage::Validate))?;
        let hostname = job.hostname();
        let output_dir = job.output_dir().map_err(|e| e.at_stage(Stage::Validate))?;
        let final_path = output_dir.join(format!("{hostname}.img.xz"));

        if self
            .cached(&final_path, job.verify_checksums)
            .await
            .map_err(|e| e.at_stage(Stage::Validate))?
        {
            info!(path = %final_path.display(), hostname = %hostname, "prepared image already present");
            return Ok(final_path);
        }

        // The guard outlives the unwind below, so a signal handler waiting on
        // the registry sees this run only after everything is released.
        let registry = self.factory.registry();
        let _active = registry.as_ref().map(ContainerRegistry::begin_run);
        let (cancel, _link) = linked_token(cancel, registry.map(|r| r.shutdown_token()));

        let mut run = Run {
            pipeline: self,
            job,
            hostname,
            output_dir,
            final_path,
            backend: None,
            held: Vec::new(),
        };
        let outcome = run.execute(&cancel).await;
        match outcome {
            Ok(path) => {
                run.finish().await;
                info!(path = %path.display(), hostname = %run.hostname, "image prepared");
                Ok(path)
            },
            Err(err) => {
                warn!(hostname = %run.hostname, error = %err, "image preparation failed, releasing resources");
                let failures = run.unwind().await;
                Err(attach(err, failures))
            },
        }
    }

    async fn cached(&self, final_path: &Path, verify: bool) -> Result<bool> {
        if !tokio::fs::try_exists(final_path).await? {
            return Ok(false);
        }
        if !verify {
            return Ok(true);
        }
        let Some(expected) = read_sidecar(final_path).await? else {
            return Ok(true);
        };
        let actual = sha256_file(final_path).await?;
        if actual == expected {
            return Ok(true);
        }
        warn!(
            path = %final_path.display(),
            expected = %expected,
            actual = %actual,
            "cached image does not match its checksum, rebuilding"
        );
        tokio::fs::remove_file(final_path).await?;
        let _ = tokio::fs::remove_file(sidecar_path(final_path)).await;
        Ok(false)
    }
}

/// Prepare `job` with [`ImagePipeline::with_defaults`].
pub async fn prepare_image(job: &PreparationJob, cancel: &CancellationToken) -> Result<PathBuf> {
    ImagePipeline::with_defaults().prepare_image(job, cancel).await
}

/// A child of `cancel` that is also cancelled by `shutdown`. The watcher
/// task ends when the returned guard drops.
fn linked_token(
    cancel: &CancellationToken,
    shutdown: Option<CancellationToken>,
) -> (CancellationToken, Option<DropGuard>) {
    let linked = cancel.child_token();
    let Some(shutdown) = shutdown else {
        return (linked, None);
    };
    let watched = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => watched.cancel(),
            () = watched.cancelled() => {},
        }
    });
    (linked.clone(), Some(linked.drop_guard()))
}

fn attach(err: Error, failures: Vec<ReleaseFailure>) -> Error {
    if failures.is_empty() {
        return err;
    }
    match err {
        Error::Stage {
            stage,
            source,
            mut release_failures,
        } => {
            release_failures.extend(failures);
            Error::Stage {
                stage,
                source,
                release_failures,
            }
        },
        other => other,
    }
}

struct Run<'a> {
    pipeline: &'a ImagePipeline,
    job: &'a PreparationJob,
    hostname: String,
    output_dir: PathBuf,
    final_path: PathBuf,
    backend: Option<Box<dyn Backend>>,
    held: Vec<Held>,
}

impl Run<'_> {
    fn backend(&self) -> Result<&dyn Backend> {
        self.backend
            .as_deref()
            .ok_or_else(|| Error::Message("no backend acquired".into()))
    }

    /// Drop the most recent entry matching `pred`.
    fn forget(&mut self, pred: impl Fn(&Held) -> bool) {
        if let Some(pos) = self.held.iter().rposition(pred) {
            self.held.remove(pos);
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<PathBuf> {
        let verify = self.job.verify_checksums;

        // workspace
        let workspace = async {
            tokio::fs::create_dir_all(&self.output_dir).await?;
            self.pipeline
                .temp
                .create_in(&self.job.temp_base(), &format!("{}-", self.hostname))
                .await
        }
        .await
        .map_err(|e| e.at_stage(Stage::Workspace))?;
        self.held.push(Held::Workspace(workspace.clone()));
        debug!(workspace = %workspace.display(), "workspace ready");

        // acquire
        let ctx = BackendContext {
            source_dir: self.job.source_dir(),
            workspace: workspace.clone(),
            output_dir: self.output_dir.clone(),
            hostname: self.hostname.clone(),
        };
        let backend = self
            .pipeline
            .factory
            .open(&ctx, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Acquire))?;
        info!(backend = backend.name(), hostname = %self.hostname, "backend acquired");
        self.backend = Some(backend);
        self.held.push(Held::Backend);

        // decompress
        let image = self
            .backend()?
            .decompress(&self.job.source, &workspace, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Decompress))?;
        self.held.push(Held::Image(image.clone()));

        // map
        self.held.push(Held::Mapping(image.clone()));
        let table = self
            .backend()?
            .map_partitions(&image, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Map))?;
        let device = table.root_device();

        // mount
        let mount_point = workspace.join("mnt");
        self.held.push(Held::Mount(mount_point.clone()));
        async {
            tokio::fs::create_dir_all(&mount_point).await?;
            let backend = self.backend()?;
            backend.mount(&device, &mount_point, cancel).await?;
            if !backend.is_mounted(&mount_point, cancel).await? {
                return Err(Error::tool(
                    "mountpoint",
                    1,
                    &format!("{} is not a mount point after mounting {}", mount_point.display(), device.display()),
                ));
            }
            Ok(())
        }
        .await
        .map_err(|e| e.at_stage(Stage::Mount))?;

        // network identity
        network::apply_network_identity(self.backend()?, &mount_point, &self.job.identity(), verify, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Network))?;

        // user mutations
        if !self.job.mutations.is_empty() {
            self.backend()?
                .apply_mutations(&mount_point, &self.job.mutations, verify, cancel)
                .await
                .map_err(|e| e.at_stage(Stage::Mutate))?;
        }

        // unmount, unmap
        self.backend()?
            .unmount(&mount_point, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Unmount))?;
        self.forget(|h| matches!(h, Held::Mount(_)));
        self.backend()?
            .unmap_partitions(&image, cancel)
            .await
            .map_err(|e| e.at_stage(Stage::Unmap))?;
        self.forget(|h| matches!(h, Held::Mapping(_)));

        // compress
        let token = uuid::Uuid::new_v4().simple().to_string();
        let partial = self
            .output_dir
            .join(format!(".{}.img.xz.partial-{}", self.hostname, &token[..8]));
        self.held.push(Held::Partial(partial.clone()));
        async {
            self.backend()?
                .compress(&image, &partial, self.pipeline.config.compression_level, cancel)
                .await?;
            let size = tokio::fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                return Err(Error::tool("xz", 1, "compressed output is missing or empty"));
            }
            Ok(())
        }
        .await
        .map_err(|e| e.at_stage(Stage::Compress))?;

        // finalize
        tokio::fs::rename(&partial, &self.final_path)
            .await
            .map_err(|e| Error::Io(e).at_stage(Stage::Finalize))?;
        self.forget(|h| matches!(h, Held::Partial(_)));
        if verify {
            async {
                let digest = sha256_file(&self.final_path).await?;
                write_sidecar(&self.final_path, &digest).await
            }
            .await
            .map_err(|e| e.at_stage(Stage::Finalize))?;
        }

        Ok(self.final_path.clone())
    }

    /// Success path: release what is left, quietly.
    async fn finish(&mut self) {
        for failure in self.unwind().await {
            warn!(resource = %failure.resource, error = %failure.message, "cleanup after a successful run failed");
        }
    }

    /// Release everything still held, newest first.
    async fn unwind(&mut self) -> Vec<ReleaseFailure> {
        let fresh = CancellationToken::new();
        let limit = Some(self.pipeline.config.release_timeout);
        let keep = self.job.keep_intermediate;
        let mut failures = Vec::new();

        while let Some(held) = self.held.pop() {
            let label = held.label();
            let outcome = match guarded(&fresh, limit, self.release(held, keep, &fresh)).await {
                Ok(result) => result,
                Err(interrupt) => Err(interrupt.into()),
            };
            if let Err(e) = outcome {
                warn!(resource = %label, error = %e, "release failed");
                failures.push(ReleaseFailure {
                    resource: label,
                    message: e.to_string(),
                });
            }
        }
        self.backend = None;
        failures
    }

    async fn release(&self, held: Held, keep: bool, cancel: &CancellationToken) -> Result<()> {
        match held {
            Held::Partial(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            Held::Mount(mount_point) => {
                let backend = self.backend()?;
                if backend.is_mounted(&mount_point, cancel).await? {
                    backend.unmount(&mount_point, cancel).await?;
                }
                Ok(())
            },
            Held::Mapping(image) => self.backend()?.unmap_partitions(&image, cancel).await,
            Held::Image(image) if keep => {
                info!(image = %image, "keeping intermediate image");
                Ok(())
            },
            Held::Image(image) => self.backend()?.discard(&image, cancel).await,
            Held::Backend => self.backend()?.close().await,
            Held::Workspace(dir) if keep => {
                info!(workspace = %dir.display(), "keeping workspace");
                self.pipeline.temp.release(&dir);
                Ok(())
            },
            Held::Workspace(dir) => self.pipeline.temp.cleanup(&dir).await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn stage_names() {
        let all = [
            Stage::Validate,
            Stage::Workspace,
            Stage::Acquire,
            Stage::Decompress,
            Stage::Map,
            Stage::Mount,
            Stage::Network,
            Stage::Mutate,
            Stage::Unmount,
            Stage::Unmap,
            Stage::Compress,
            Stage::Finalize,
        ];
        let names: Vec<String> = all.iter().map(ToString::to_string).collect();
        assert_eq!(names[4], "map");
        assert_eq!(names.last().map(String::as_str), Some("finalize"));
        assert!(names.iter().all(|n| n.chars().all(|c| c.is_ascii_lowercase())));
    }

    #[tokio::test]
    async fn linked_token_follows_both_parents() {
        let caller = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let (token, _guard) = linked_token(&caller, Some(shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(!caller.is_cancelled());

        let (token, guard) = linked_token(&caller, Some(CancellationToken::new()));
        caller.cancel();
        assert!(token.is_cancelled());
        drop(guard);
    }

    #[test]
    fn attach_appends_to_stage_errors_only() {
        let failure = ReleaseFailure {
            resource: "mount /ws/mnt".into(),
            message: "target is busy".into(),
        };
        let err = attach(Error::tool("kpartx", 1, "boom").at_stage(Stage::Map), vec![failure.clone()]);
        assert_eq!(err.release_failures(), [failure.clone()]);

        let bare = attach(Error::invalid("x"), vec![failure]);
        assert!(bare.release_failures().is_empty());
    }
}
