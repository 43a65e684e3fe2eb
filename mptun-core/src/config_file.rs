//! Per-role TOML config files: platform default paths, load and save.

use crate::control::{ClientConfig, ConfigError, RelayConfig, ServerConfig};
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Config file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("could not determine platform config directory")]
    NoConfigDir,

    #[error("failed to read config: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse TOML: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config to TOML")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("config already exists at {} (use --force to overwrite)", .0.display())]
    Exists(PathBuf),
}

/// A role whose config lives in its own file.
pub trait RoleConfig: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    fn check(&self) -> Result<(), ConfigError>;
}

impl RoleConfig for ClientConfig {
    const FILE_NAME: &'static str = "mptun-client.toml";

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

impl RoleConfig for ServerConfig {
    const FILE_NAME: &'static str = "mptun-server.toml";

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

impl RoleConfig for RelayConfig {
    const FILE_NAME: &'static str = "mptun-relay.toml";

    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

pub fn default_path<T: RoleConfig>() -> Result<PathBuf, ConfigFileError> {
    let proj = ProjectDirs::from("io", "mptun", "mptun").ok_or(ConfigFileError::NoConfigDir)?;
    Ok(proj.config_dir().join(T::FILE_NAME))
}

/// `path` or, when unset, the role's default path.
pub fn resolve_path<T: RoleConfig>(path: Option<PathBuf>) -> Result<PathBuf, ConfigFileError> {
    match path {
        Some(p) => Ok(p),
        None => default_path::<T>(),
    }
}

/// Load and validate a config. A missing file yields the defaults.
pub fn load<T: RoleConfig>(path: &Path) -> Result<T, ConfigFileError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(ConfigFileError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let cfg: T = toml::from_str(&raw).map_err(|source| ConfigFileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    cfg.check().map_err(|source| ConfigFileError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(cfg)
}

/// Write `cfg`, creating parent directories. An existing file is only
/// replaced with `overwrite`.
pub fn save<T: RoleConfig>(path: &Path, cfg: &T, overwrite: bool) -> Result<(), ConfigFileError> {
    if path.exists() && !overwrite {
        return Err(ConfigFileError::Exists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigFileError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(|source| ConfigFileError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TransportKind;

    #[test]
    fn test_default_paths_differ_per_role() {
        let client = default_path::<ClientConfig>().unwrap();
        let relay = default_path::<RelayConfig>().unwrap();
        assert!(client.ends_with("mptun-client.toml"));
        assert!(relay.ends_with("mptun-relay.toml"));
        assert_eq!(client.parent(), relay.parent());

        let explicit = PathBuf::from("/tmp/custom.toml");
        assert_eq!(
            resolve_path::<ServerConfig>(Some(explicit.clone())).unwrap(),
            explicit
        );
    }

    #[test]
    fn test_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: ClientConfig = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");
        let mut cfg = ServerConfig::default();
        cfg.remote_addr = "127.0.0.1:8053".to_string();
        cfg.engine.max_retries = Some(3);

        save(&path, &cfg, false).unwrap();
        assert_eq!(load::<ServerConfig>(&path).unwrap(), cfg);
    }

    #[test]
    fn test_save_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        save(&path, &ClientConfig::default(), false).unwrap();

        let err = save(&path, &ClientConfig::default(), false).unwrap_err();
        assert!(matches!(err, ConfigFileError::Exists(_)));
        assert!(err.to_string().contains("--force"));
        save(&path, &ClientConfig::default(), true).unwrap();
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        fs::write(&path, "listen_addr = \"127.0.0.1:1\"\nrelay_peers = []\n").unwrap();
        assert!(matches!(
            load::<ClientConfig>(&path),
            Err(ConfigFileError::Invalid {
                source: ConfigError::NoRelayPeers,
                ..
            })
        ));

        let mut relay = RelayConfig::default();
        relay.forward_transport = TransportKind::Both;
        let path = dir.path().join("relay.toml");
        save(&path, &relay, false).unwrap();
        assert!(matches!(
            load::<RelayConfig>(&path),
            Err(ConfigFileError::Invalid { .. })
        ));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        fs::write(&path, "listen_addr = [").unwrap();
        assert!(matches!(
            load::<ServerConfig>(&path),
            Err(ConfigFileError::Parse { .. })
        ));
    }
}
