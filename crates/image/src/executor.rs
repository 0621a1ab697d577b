//! Pick the backend for a run: native host tools when the host has them,
//! a privileged worker container otherwise.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
    turingpi_container::{ContainerRegistry, ContainerSession, ContainerSpec, SessionOptions},
};

use crate::{
    backend::{Backend, ContainerBackend, HostBackend},
    error::Result,
    network::{self, NetworkFamily, NetworkIdentity},
    runner::{ContainerRunner, HostRunner},
};

const NATIVE_TOOLS: [&str; 3] = ["kpartx", "mount", "umount"];

/// What a backend needs to know about one run.
#[derive(Debug, Clone)]
pub struct BackendContext {
    /// Directory holding the compressed source image.
    pub source_dir: PathBuf,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
    pub hostname: String,
}

#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn open(&self, ctx: &BackendContext, cancel: &CancellationToken)
    -> Result<Box<dyn Backend>>;

    /// Registry that owns the containers this factory creates. Runs are
    /// counted against it so a termination signal waits for their unwind,
    /// and its shutdown token cancels them.
    fn registry(&self) -> Option<Arc<ContainerRegistry>> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Native when possible, container otherwise.
    #[default]
    Auto,
    Host,
    Container,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "host" | "native" => Ok(Self::Host),
            "container" => Ok(Self::Container),
            other => Err(format!("unknown execution mode {other:?}")),
        }
    }
}

/// Worker container settings.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub image: String,
    pub name_prefix: String,
    pub session: SessionOptions,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: turingpi_container::PRIVILEGED_IMAGE.into(),
            name_prefix: "turingpi-prep".into(),
            session: SessionOptions::default(),
        }
    }
}

pub struct Executor {
    mode: ExecutionMode,
    container: ContainerSettings,
    registry: Arc<ContainerRegistry>,
    expansion_ratio: f64,
}

impl Executor {
    #[must_use]
    pub fn new(
        mode: ExecutionMode,
        container: ContainerSettings,
        registry: Arc<ContainerRegistry>,
        expansion_ratio: f64,
    ) -> Self {
        Self {
            mode,
            container,
            registry,
            expansion_ratio,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// Resolve [`ExecutionMode::Auto`] against the host.
    #[must_use]
    pub fn effective_mode(&self) -> ExecutionMode {
        match self.mode {
            ExecutionMode::Auto if host_supports_native() => ExecutionMode::Host,
            ExecutionMode::Auto => ExecutionMode::Container,
            other => other,
        }
    }

    fn container_spec(&self, ctx: &BackendContext) -> ContainerSpec {
        let name = format!("{}-{}", self.container.name_prefix, sanitize(&ctx.hostname));
        let mut spec = ContainerSpec::privileged_tooling(
            name,
            &ctx.source_dir,
            &ctx.workspace,
            &ctx.output_dir,
        )
        .with_unique_suffix()
        .with_label("turingpi.hostname", ctx.hostname.clone());
        spec.image = self.container.image.clone();
        spec
    }

    /// Forwarded so callers holding only an executor-chosen backend can set a
    /// node identity without the pipeline.
    pub async fn apply_network_identity(
        &self,
        backend: &dyn Backend,
        root: &Path,
        id: &NetworkIdentity,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<NetworkFamily> {
        network::apply_network_identity(backend, root, id, verify, cancel).await
    }
}

#[async_trait]
impl BackendFactory for Executor {
    fn registry(&self) -> Option<Arc<ContainerRegistry>> {
        Some(Arc::clone(&self.registry))
    }

    async fn open(
        &self,
        ctx: &BackendContext,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Backend>> {
        match self.effective_mode() {
            ExecutionMode::Host => {
                let elevate = !is_root();
                info!(elevate, "using native host tools");
                Ok(Box::new(HostBackend::new(HostRunner::new(elevate)?)))
            },
            _ => {
                let spec = self.container_spec(ctx);
                info!(container = %spec.name, image = %spec.image, "using worker container");
                let session = ContainerSession::acquire(
                    spec,
                    Arc::clone(&self.registry),
                    self.container.session.clone(),
                    cancel,
                )
                .await?;
                Ok(Box::new(ContainerBackend::new(
                    ContainerRunner::new(session),
                    self.expansion_ratio,
                )))
            },
        }
    }
}

/// Container names allow `[a-zA-Z0-9_.-]`.
fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() { "node".into() } else { cleaned }
}

/// Linux with the mapping and mount tools on `PATH`.
#[must_use]
pub fn host_supports_native() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    let missing: Vec<&str> = NATIVE_TOOLS
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect();
    if !missing.is_empty() {
        debug!(?missing, "native image tools unavailable");
    }
    missing.is_empty()
}

/// Effective uid 0. Asks `id -u` first, then the shell's environment.
#[must_use]
pub fn is_root() -> bool {
    if cfg!(windows) {
        return false;
    }
    if let Ok(out) = std::process::Command::new("id").arg("-u").output()
        && out.status.success()
        && let Ok(uid) = String::from_utf8_lossy(&out.stdout).trim().parse::<u32>()
    {
        return uid == 0;
    }
    root_from_env(|key| std::env::var(key).ok())
}

fn root_from_env(get: impl Fn(&str) -> Option<String>) -> bool {
    if let Some(uid) = get("EUID")
        .or_else(|| get("UID"))
        .and_then(|value| value.trim().parse::<u32>().ok())
    {
        return uid == 0;
    }
    get("USER")
        .or_else(|| get("LOGNAME"))
        .is_some_and(|user| user.trim() == "root")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest, std::collections::HashMap};

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[rstest]
    #[case(&[("EUID", "0")], true)]
    #[case(&[("EUID", "1000"), ("USER", "root")], false)]
    #[case(&[("UID", "0")], true)]
    #[case(&[("USER", "root")], true)]
    #[case(&[("LOGNAME", "pi")], false)]
    #[case(&[], false)]
    fn root_detection_from_env(#[case] pairs: &[(&str, &str)], #[case] root: bool) {
        assert_eq!(root_from_env(env(pairs)), root);
    }

    #[rstest]
    #[case("node1", "node1")]
    #[case("rk1 #3", "rk1--3")]
    #[case("", "node")]
    fn container_name_sanitizing(#[case] raw: &str, #[case] want: &str) {
        assert_eq!(sanitize(raw), want);
    }

    #[rstest]
    #[case("auto", ExecutionMode::Auto)]
    #[case("Host", ExecutionMode::Host)]
    #[case("native", ExecutionMode::Host)]
    #[case("container", ExecutionMode::Container)]
    fn mode_parsing(#[case] raw: &str, #[case] mode: ExecutionMode) {
        assert_eq!(raw.parse::<ExecutionMode>().unwrap(), mode);
        assert!("docker".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn explicit_modes_are_not_resolved() {
        let registry = Arc::new(ContainerRegistry::new(Vec::new(), Default::default()));
        let exec = Executor::new(
            ExecutionMode::Container,
            ContainerSettings::default(),
            registry,
            4.0,
        );
        assert_eq!(exec.effective_mode(), ExecutionMode::Container);
    }

    #[test]
    fn worker_spec_uses_privileged_layout() {
        let registry = Arc::new(ContainerRegistry::new(Vec::new(), Default::default()));
        let exec = Executor::new(ExecutionMode::Container, ContainerSettings::default(), registry, 4.0);
        let spec = exec.container_spec(&BackendContext {
            source_dir: "/srv/images".into(),
            workspace: "/var/tmp/turingpi/node1-abcd".into(),
            output_dir: "/srv/prepared".into(),
            hostname: "node1".into(),
        });
        spec.validate().unwrap();
        assert!(spec.name.starts_with("turingpi-prep-node1-"));
        assert_eq!(
            spec.container_path_for(Path::new("/var/tmp/turingpi/node1-abcd/mnt")),
            Some(PathBuf::from("/tmp/mnt"))
        );
        assert_eq!(
            spec.container_path_for(Path::new("/srv/prepared/node1.img.xz")),
            Some(PathBuf::from("/prepared-images/node1.img.xz"))
        );
    }
}
