//! Configuration loading, validation, and env substitution.
//!
//! Config files: `turingpi.toml`, `turingpi.yaml`, or `turingpi.json`
//! Searched in `./` then `~/.config/turingpi/` (or `$TURINGPI_CONFIG_DIR`).
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config,
        save_config, set_config_dir,
    },
    schema::{
        BmcConfig, ContainerConfig, ImagesConfig, NetworkConfig, NodeConfig, RetryConfig,
        TuringPiConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult},
};
