//! TOML persistence for [`ClientConfig`].
//!
//! The default location is platform specific:
//! - Windows:  `%APPDATA%\PeripheralBridge\client.toml`
//! - Linux:    `~/.config/peripheral-bridge/client.toml`
//! - macOS:    `~/Library/Application Support/PeripheralBridge/client.toml`
//!
//! A missing file is not an error: the client runs on defaults.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::config::{ClientConfig, ConfigError};

const CONFIG_FILE_NAME: &str = "client.toml";

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the base directory cannot
/// be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads the config from `path`, or from the platform default location when
/// `path` is `None`.
///
/// Returns `ClientConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`] for
/// out-of-range values.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            debug!("loading client config from {}", path.display());
            ClientConfig::from_toml_str(&content)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no config at {}; using defaults", path.display());
            Ok(ClientConfig::default())
        }
        Err(source) => Err(ConfigError::Io { path, source }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ClientConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("PeripheralBridge"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("peripheral-bridge"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("PeripheralBridge")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "peripheral-client-{name}-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        // Arrange
        let path = scratch_dir("missing").join("nope.toml");

        // Act
        let cfg = load_config(Some(&path)).expect("missing file is not an error");

        // Assert
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn test_save_then_load_returns_same_config() {
        // Arrange
        let dir = scratch_dir("roundtrip");
        let path = dir.join("nested").join(CONFIG_FILE_NAME);
        let mut cfg = ClientConfig::default();
        cfg.endpoint = "ws://10.0.0.5:9100/stomp".to_string();

        // Act
        save_config(&cfg, &path).expect("save");
        let loaded = load_config(Some(&path)).expect("load");

        // Assert
        assert_eq!(loaded, cfg);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_load_invalid_values_is_an_error() {
        let dir = scratch_dir("invalid");
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "endpoint = \"tcp://x\"\n").expect("write");

        let result = load_config(Some(&path));

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_config_file_path_ends_with_file_name() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with(CONFIG_FILE_NAME));
        }
    }
}
