//! Declarative description of a worker container.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

/// Tag of the privileged tooling image built from [`PRIVILEGED_DOCKERFILE`].
pub const PRIVILEGED_IMAGE: &str = "turingpi-image-prep:latest";

/// Label carried by every container this crate creates.
pub const MANAGED_LABEL: &str = "turingpi.managed";

/// Single-stage recipe for the privileged tooling image.
pub const PRIVILEGED_DOCKERFILE: &str = "\
FROM ubuntu:24.04
ENV DEBIAN_FRONTEND=noninteractive
RUN apt-get update -qq \\
    && apt-get install -y -qq --no-install-recommends \\
        kpartx xz-utils sudo parted e2fsprogs dosfstools mount gawk coreutils util-linux \\
    && rm -rf /var/lib/apt/lists/*
WORKDIR /tmp
CMD [\"sleep\", \"infinity\"]
";

/// Container-side paths of the privileged layout.
pub mod privileged {
    pub const IMAGES: &str = "/images";
    pub const TMP: &str = "/tmp";
    pub const OUTPUT: &str = "/prepared-images";
}

/// Container-side paths of the standard worker layout.
pub mod standard {
    pub const SOURCE: &str = "/source";
    pub const TMP: &str = "/tmp";
    pub const OUTPUT: &str = "/output";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: PathBuf,
    pub read_only: bool,
}

impl Mount {
    #[must_use]
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only,
        }
    }

    /// Docker `binds` entry: `host:container[:ro]`.
    #[must_use]
    pub fn bind(&self) -> String {
        let suffix = if self.read_only { ":ro" } else { "" };
        format!(
            "{}:{}{suffix}",
            self.host.display(),
            self.container.display()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub working_dir: Option<String>,
    pub mounts: Vec<Mount>,
    /// Argv vectors run once after the container starts.
    pub init_commands: Vec<Vec<String>>,
    pub network_disabled: bool,
    pub privileged: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Ordinary worker: `/source` read-only, `/tmp` and `/output` writable.
    #[must_use]
    pub fn standard(
        image: impl Into<String>,
        name: impl Into<String>,
        source_dir: &Path,
        tmp_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            working_dir: Some(standard::TMP.into()),
            mounts: vec![
                Mount::new(source_dir, standard::SOURCE, true),
                Mount::new(tmp_dir, standard::TMP, false),
                Mount::new(output_dir, standard::OUTPUT, false),
            ],
            init_commands: Vec::new(),
            network_disabled: true,
            privileged: false,
            labels: managed_labels(),
        }
    }

    /// Privileged tooling worker used for loop devices and mounts.
    #[must_use]
    pub fn privileged_tooling(
        name: impl Into<String>,
        images_dir: &Path,
        tmp_dir: &Path,
        output_dir: &Path,
    ) -> Self {
        Self {
            image: PRIVILEGED_IMAGE.into(),
            name: name.into(),
            working_dir: Some(privileged::TMP.into()),
            mounts: vec![
                Mount::new(images_dir, privileged::IMAGES, true),
                Mount::new(tmp_dir, privileged::TMP, false),
                Mount::new(output_dir, privileged::OUTPUT, false),
            ],
            init_commands: Vec::new(),
            network_disabled: true,
            privileged: true,
            labels: managed_labels(),
        }
    }

    /// Append a short random token so concurrent pipelines never collide.
    #[must_use]
    pub fn with_unique_suffix(mut self) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.name = format!("{}-{}", self.name, &token[..8]);
        self
    }

    #[must_use]
    pub fn with_init_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.init_commands
            .push(argv.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_privileged_tooling(&self) -> bool {
        self.image == PRIVILEGED_IMAGE
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InputInvalid("image name is empty".into()));
        }
        if !is_valid_name(&self.name) {
            return Err(Error::InputInvalid(format!(
                "container name {:?} must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
                self.name
            )));
        }
        for mount in &self.mounts {
            if !mount.host.is_absolute() || !mount.container.is_absolute() {
                return Err(Error::InputInvalid(format!(
                    "mount {} must use absolute paths",
                    mount.bind()
                )));
            }
        }
        if self.init_commands.iter().any(Vec::is_empty) {
            return Err(Error::InputInvalid("empty init command".into()));
        }
        if self.is_privileged_tooling() {
            if !self.privileged {
                return Err(Error::InputInvalid(format!(
                    "{PRIVILEGED_IMAGE} requires a privileged container"
                )));
            }
            for (target, read_only) in [
                (privileged::IMAGES, true),
                (privileged::TMP, false),
                (privileged::OUTPUT, false),
            ] {
                let present = self
                    .mounts
                    .iter()
                    .any(|m| m.container == Path::new(target) && m.read_only == read_only);
                if !present {
                    return Err(Error::InputInvalid(format!(
                        "{PRIVILEGED_IMAGE} requires the {target} mount{}",
                        if read_only { " (read-only)" } else { "" }
                    )));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().map(Mount::bind).collect()
    }

    /// Translate a host path into the container's view through the mount with
    /// the longest matching host prefix.
    #[must_use]
    pub fn container_path_for(&self, host: &Path) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter_map(|m| host.strip_prefix(&m.host).ok().map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.host.components().count())
            .map(|(m, rest)| join_clean(&m.container, rest))
    }

    /// Inverse of [`Self::container_path_for`].
    #[must_use]
    pub fn host_path_for(&self, container: &Path) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter_map(|m| container.strip_prefix(&m.container).ok().map(|rest| (m, rest)))
            .max_by_key(|(m, _)| m.container.components().count())
            .map(|(m, rest)| join_clean(&m.host, rest))
    }
}

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}

fn join_clean(base: &Path, rest: &Path) -> PathBuf {
    if rest.as_os_str().is_empty() {
        base.to_path_buf()
    } else {
        base.join(rest)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
