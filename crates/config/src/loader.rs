use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::PairgateConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "pairgate.toml",
    "pairgate.yaml",
    "pairgate.yml",
    "pairgate.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

fn override_slot() -> MutexGuard<'static, Option<PathBuf>> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Restrict config discovery to `path`. Each call replaces the previous override.
pub fn set_config_dir(path: PathBuf) {
    *override_slot() = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *override_slot() = None;
}

fn config_dir_override() -> Option<PathBuf> {
    override_slot().clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<PairgateConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./pairgate.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/pairgate/pairgate.{toml,yaml,yml,json}` (user-global)
///
/// A missing or unreadable file yields `PairgateConfig::default()`.
pub fn discover_and_load() -> PairgateConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return PairgateConfig::default();
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        PairgateConfig::default()
    })
}

fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        // Override is set: never fall through to other locations.
        return first_existing(&dir);
    }

    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|dir| first_existing(&dir)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/pairgate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("pairgate"))
}

/// Returns the data directory: `~/.pairgate/`, or `./.pairgate` without a home.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".pairgate"))
        .unwrap_or_else(|| PathBuf::from(".pairgate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    find_config_file().unwrap_or_else(|| {
        config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pairgate.toml")
    })
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<PairgateConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_override_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pairgate.toml"),
            "[gateway]\nport = 9000\n\n[whatsapp]\nclient_id = \"shop-till\"\n",
        )
        .unwrap();

        set_config_dir(dir.path().to_path_buf());
        let cfg = discover_and_load();
        let found = find_or_default_config_path();
        clear_config_dir();

        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.whatsapp.client_id, "shop-till");
        assert_eq!(found, dir.path().join("pairgate.toml"));
    }

    #[test]
    fn loads_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("pairgate.yaml");
        std::fs::write(&yaml, "whatsapp:\n  queue_capacity: 10\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().whatsapp.queue_capacity, Some(10));

        let json = dir.path().join("pairgate.json");
        std::fs::write(&json, r#"{"whatsapp": {"restart": {"backoff_factor": 2.0}}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().whatsapp.restart.backoff_factor, 2.0);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairgate.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
