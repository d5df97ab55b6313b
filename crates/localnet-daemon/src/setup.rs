//! Locating, reading and writing the config file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::DaemonError;

/// Read the config at `path`, or at [`default_config_path`] when `None`.
///
/// A missing file yields the defaults; an unreadable or invalid one is an
/// error.
pub fn load_config(path: Option<&str>) -> Result<Config, DaemonError> {
    let path = path.map_or_else(default_config_path, PathBuf::from);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(e) => {
            return Err(DaemonError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        }
    };
    let config = toml::from_str(&text)
        .map_err(|e| DaemonError::Config(format!("invalid {}: {e}", path.display())))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Write `config` to `path` as TOML, creating parent directories.
pub fn write_config(path: &Path, config: &Config) -> Result<(), DaemonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DaemonError::Config(format!("cannot create {}: {e}", parent.display())))?;
    }
    let text = toml::to_string_pretty(config)
        .map_err(|e| DaemonError::Config(format!("cannot serialise config: {e}")))?;
    std::fs::write(path, text)
        .map_err(|e| DaemonError::Config(format!("cannot write {}: {e}", path.display())))?;
    info!(path = %path.display(), "wrote config");
    Ok(())
}

/// Per-user config directory (`<config dir>/localnet`).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("localnet")
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("localnet-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = load_config(Some("/nonexistent/localnet/config.toml")).unwrap();
        assert_eq!(config.network.session_port, 63287);
    }

    #[test]
    fn reads_and_rejects_files() {
        let dir = scratch_dir("setup");
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.toml");
        std::fs::write(&good, "[network]\nsession_port = 9000\n").unwrap();
        let config = load_config(good.to_str()).unwrap();
        assert_eq!(config.network.session_port, 9000);
        assert_eq!(config.network.discovery_port, 60000);

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "[network\n").unwrap();
        assert!(matches!(
            load_config(bad.to_str()),
            Err(DaemonError::Config(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn written_config_loads_back() {
        let dir = scratch_dir("write");
        let path = dir.join("nested").join("config.toml");
        let mut config = Config::default();
        config.daemon.host_joins_as_client = false;
        config.election.candidate_timeout_ms = 2500;

        write_config(&path, &config).unwrap();
        let loaded = load_config(path.to_str()).unwrap();
        assert!(!loaded.daemon.host_joins_as_client);
        assert_eq!(loaded.election.candidate_timeout_ms, 2500);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_path_ends_in_localnet() {
        assert!(default_config_path().ends_with("localnet/config.toml"));
    }
}
