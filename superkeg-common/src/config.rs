//! Configuration file location and root folder resolution

use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "SUPERKEG_ROOT";

/// Environment variable naming the bootstrap TOML file
pub const CONFIG_FILE_ENV: &str = "SUPERKEG_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "kegs.db";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML config value
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Locate the bootstrap TOML file
///
/// An explicit path must exist. Without one, the environment variable is
/// consulted, then `~/.config/superkeg/config.toml`, then
/// `/etc/superkeg/config.toml`.
pub fn locate_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Config(format!("Config file not found: {}", path.display())));
    }

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        warn!("{} points at missing file {}", CONFIG_FILE_ENV, path.display());
    }

    let user_config = dirs::config_dir().map(|d| d.join("superkeg").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Ok(path);
        }
    }

    let system_config = PathBuf::from("/etc/superkeg/config.toml");
    if system_config.exists() {
        return Ok(system_config);
    }

    Err(Error::Config("No config file found".to_string()))
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/superkeg (or /var/lib/superkeg for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("superkeg"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/superkeg"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("superkeg"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/superkeg"))
    } else {
        PathBuf::from("./superkeg_data")
    }
}

/// Database path inside a root folder
pub fn database_path(root_folder: &Path) -> PathBuf {
    root_folder.join(DATABASE_FILE_NAME)
}

/// Write a file atomically (temp file + rename)
///
/// Readers never observe a half-written file; a crash leaves either the old
/// content or the new one.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp_name = target.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    std::fs::write(&temp_path, contents)?;
    std::fs::rename(&temp_path, target)?;
    Ok(())
}
