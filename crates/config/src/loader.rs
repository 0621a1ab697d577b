use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::TuringPiConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "turingpi.toml",
    "turingpi.yaml",
    "turingpi.yml",
    "turingpi.json",
];

/// Overrides the user-global config directory.
pub const CONFIG_DIR_ENV: &str = "TURINGPI_CONFIG_DIR";

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Point [`config_dir`] at `dir` for the rest of the process.
pub fn set_config_dir(dir: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(dir);
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<TuringPiConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations, then apply env overrides.
///
/// Search order:
/// 1. `./turingpi.{toml,yaml,yml,json}` (project-local)
/// 2. `$TURINGPI_CONFIG_DIR` or `~/.config/turingpi/` (user-global)
///
/// Falls back to `TuringPiConfig::default()` if no file is found or the file
/// fails to parse.
pub fn discover_and_load() -> TuringPiConfig {
    let mut config = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            match load_config(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
                    TuringPiConfig::default()
                },
            }
        },
        None => {
            debug!("no config file found, using defaults");
            TuringPiConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    config
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    let dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/turingpi/`), or the
/// directory set by [`set_config_dir`] or named by `TURINGPI_CONFIG_DIR`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
    {
        return Some(dir);
    }
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", "turingpi").map(|d| d.config_dir().to_path_buf())
}

/// Serialize `config` to TOML at `path`, creating parent directories.
pub fn save_config(config: &TuringPiConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| Error::Serialize(e.to_string()))?;
    std::fs::write(path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(())
}

/// Apply `TURINGPI_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(config: &mut TuringPiConfig) {
    apply_env_overrides_with(config, |name| std::env::var(name).ok());
}

pub(crate) fn apply_env_overrides_with(
    config: &mut TuringPiConfig,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(dir) = get("TURINGPI_OUTPUT_DIR") {
        config.images.output_dir = Some(PathBuf::from(dir));
    }
    if let Some(dir) = get("TURINGPI_TEMP_DIR") {
        config.images.temp_dir = Some(PathBuf::from(dir));
    }
    if let Some(image) = get("TURINGPI_WORKER_IMAGE") {
        config.container.worker_image = image;
    }
    if let Some(ctx) = get("DOCKER_CONTEXT") {
        config.container.docker_context = Some(ctx);
    }
    if let Some(host) = get("DOCKER_HOST") {
        config.container.docker_host = Some(host);
    }
}

pub(crate) fn parse_config(raw: &str, path: &Path) -> Result<TuringPiConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| Error::parse("toml", e)),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| Error::parse("yaml", e)),
        "json" => serde_json::from_str(raw).map_err(|e| Error::parse("json", e)),
        _ => Err(Error::UnsupportedFormat(ext.to_string())),
    }
}

/// Parse into an untyped JSON value, used by validation to spot unknown keys.
pub(crate) fn parse_config_value(raw: &str, path: &Path) -> Result<serde_json::Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw).map_err(|e| Error::parse("toml", e))?;
            serde_json::to_value(v).map_err(|e| Error::parse("toml", e))
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| Error::parse("yaml", e))?;
            serde_json::to_value(v).map_err(|e| Error::parse("yaml", e))
        },
        "json" => serde_json::from_str(raw).map_err(|e| Error::parse("json", e)),
        _ => Err(Error::UnsupportedFormat(ext.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, std::net::Ipv4Addr};

    #[test]
    fn loads_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("turingpi.toml");
        std::fs::write(&toml_path, "[network]\nprefix_len = 16\n").unwrap();
        assert_eq!(load_config(&toml_path).unwrap().network.prefix_len, 16);

        let yaml_path = dir.path().join("turingpi.yaml");
        std::fs::write(&yaml_path, "network:\n  dns: [\"9.9.9.9\"]\n").unwrap();
        assert_eq!(
            load_config(&yaml_path).unwrap().network.dns,
            vec![Ipv4Addr::new(9, 9, 9, 9)]
        );

        let json_path = dir.path().join("turingpi.json");
        std::fs::write(&json_path, r#"{"bmc":{"host":"10.0.0.2"}}"#).unwrap();
        assert_eq!(
            load_config(&json_path).unwrap().bmc.host.as_deref(),
            Some("10.0.0.2")
        );
    }

    #[test]
    fn rejects_unknown_extension() {
        let err = parse_config("", Path::new("turingpi.ini")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(ref e) if e == "ini"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/turingpi.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/turingpi.toml"));
    }

    #[test]
    fn env_overrides_replace_paths_and_image() {
        let mut cfg = TuringPiConfig::default();
        apply_env_overrides_with(&mut cfg, |name| match name {
            "TURINGPI_OUTPUT_DIR" => Some("/srv/images".into()),
            "TURINGPI_WORKER_IMAGE" => Some("registry.local/prep:2".into()),
            "TURINGPI_TEMP_DIR" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.images.output_dir, Some(PathBuf::from("/srv/images")));
        assert_eq!(cfg.container.worker_image, "registry.local/prep:2");
        assert!(cfg.images.temp_dir.is_none());
    }

    #[test]
    fn save_then_load_preserves_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/turingpi.toml");
        let mut cfg = TuringPiConfig::default();
        cfg.nodes.push(crate::schema::NodeConfig {
            index: 3,
            hostname: Some("worker-3".into()),
            ..Default::default()
        });
        save_config(&cfg, &path).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.node(3).unwrap().hostname.as_deref(), Some("worker-3"));
    }
}
