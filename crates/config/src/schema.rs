//! Config schema types (container runtime, image preparation, cluster layout).
use std::{net::Ipv4Addr, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Tag of the privileged worker image built from the embedded Dockerfile.
pub const DEFAULT_PRIVILEGED_IMAGE: &str = "turingpi-image-prep:latest";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuringPiConfig {
    pub container: ContainerConfig,
    pub images: ImagesConfig,
    pub network: NetworkConfig,
    pub bmc: BmcConfig,
    pub nodes: Vec<NodeConfig>,
    pub retry: RetryConfig,
}

impl TuringPiConfig {
    /// Node entry for a 1-based slot index, if configured.
    #[must_use]
    pub fn node(&self, index: u8) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.index == index)
    }
}

/// Container runtime settings used when image tooling is not available natively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image used for the worker container.
    pub worker_image: String,
    /// Prefix for container names created by this process.
    pub name_prefix: String,
    /// Named daemon context, overriding the CLI's current context.
    pub docker_context: Option<String>,
    /// Explicit daemon address, consulted after the context.
    pub docker_host: Option<String>,
    /// Grace period passed to `stop` before force removal.
    pub stop_grace_secs: u64,
    /// Ceiling for cleaning up one container.
    pub cleanup_timeout_secs: u64,
    /// Ceiling for a whole registry sweep.
    pub sweep_timeout_secs: u64,
    /// Deadline applied to each exec inside the worker; `None` waits forever.
    pub exec_timeout_secs: Option<u64>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            worker_image: DEFAULT_PRIVILEGED_IMAGE.into(),
            name_prefix: "turingpi-prep".into(),
            docker_context: None,
            docker_host: None,
            stop_grace_secs: 5,
            cleanup_timeout_secs: 30,
            sweep_timeout_secs: 120,
            exec_timeout_secs: Some(1800),
        }
    }
}

/// Image preparation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Where finished `<hostname>.img.xz` artefacts land. Defaults to the user
    /// cache directory.
    pub output_dir: Option<PathBuf>,
    /// Base for scoped temp workspaces. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// XZ preset, 0..=9.
    pub compression_level: u32,
    /// Expected raw-to-compressed size ratio, used for disk budgeting.
    pub expansion_ratio: f64,
    /// Temp workspaces older than this are swept.
    pub temp_max_age_secs: u64,
    /// Cadence of the background temp sweeper.
    pub sweep_interval_secs: u64,
    pub keep_intermediate: bool,
    pub verify_checksums: bool,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            temp_dir: None,
            compression_level: 6,
            expansion_ratio: 4.0,
            temp_max_age_secs: 6 * 60 * 60,
            sweep_interval_secs: 300,
            keep_intermediate: false,
            verify_checksums: false,
        }
    }
}

/// Cluster-wide network defaults applied when a node entry omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            prefix_len: 24,
            gateway: None,
            dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
        }
    }
}

/// Remote shell coordinates of the board management controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            user: "root".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 1-based slot on the carrier board.
    pub index: u8,
    pub hostname: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub user: Option<String>,
}

/// Backoff for remote shell operations: `initial_delay_ms`, then
/// `+ increment_ms` per further attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub increment_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 1000,
            increment_ms: 1000,
        }
    }
}
