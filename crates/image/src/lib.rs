//! Node image preparation.
//!
//! [`prepare_image`] decompresses an OS image, maps and mounts its root
//! partition, writes the node's network identity plus any extra
//! [`MutationOp`]s, and repacks it as `<output>/<hostname>.img.xz`. Stages run
//! on host tools when the host has them and inside a privileged worker
//! container otherwise.

pub mod backend;
pub mod budget;
pub mod checksum;
pub mod error;
pub mod executor;
pub mod job;
pub mod location;
pub mod mutation;
pub mod network;
pub mod partition;
pub mod pipeline;
pub mod runner;
pub mod tempdir;
pub mod xz;

pub use {
    backend::{Backend, ContainerBackend, HostBackend},
    checksum::FileChecksum,
    error::{Error, ReleaseFailure, Result},
    executor::{BackendContext, BackendFactory, ContainerSettings, ExecutionMode, Executor},
    job::{PreparationJob, default_output_dir, is_hostname_label},
    location::ImageLocation,
    mutation::{MutationOp, MutationPlanner, apply_mutations},
    network::{NetworkFamily, NetworkIdentity, apply_network_identity, netmask_for_prefix},
    partition::{MappedPartition, PartitionTable, parse_mapping},
    pipeline::{ImagePipeline, PipelineConfig, Stage, prepare_image},
    runner::{CommandRunner, ContainerRunner, HostRunner},
    tempdir::TempManager,
};
