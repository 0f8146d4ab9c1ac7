//! XDG Base Directory paths for maestro.
//!
//! The CLI resolves its user configuration and persisted state snapshots
//! through these helpers so every platform gets the same layout.

use std::path::PathBuf;

const APP_DIR: &str = "maestro";

/// Get the maestro config directory.
///
/// Returns `$XDG_CONFIG_HOME/maestro` if set, otherwise `~/.config/maestro`.
///
/// # Examples
///
/// ```
/// use maestro_paths::config_dir;
///
/// let config = config_dir();
/// let file = config.join("config.toml");
/// ```
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join(APP_DIR)
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config").join(APP_DIR)
    } else {
        PathBuf::from(".config").join(APP_DIR)
    }
}

/// Get the maestro data directory.
///
/// Returns `$XDG_DATA_HOME/maestro` if set, otherwise `~/.local/share/maestro`.
/// State snapshots are written here.
pub fn data_dir() -> PathBuf {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg_data).join(APP_DIR)
    } else if let Some(home) = dirs::home_dir() {
        home.join(".local/share").join(APP_DIR)
    } else {
        PathBuf::from(".local/share").join(APP_DIR)
    }
}

/// Path of the user-level configuration file.
pub fn user_config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default location for the state snapshot written by `maestro run`.
pub fn default_snapshot_file() -> PathBuf {
    data_dir().join("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_dir_ends_with_app_name() {
        assert!(config_dir().ends_with("maestro"));
    }

    #[test]
    fn data_dir_ends_with_app_name() {
        assert!(data_dir().ends_with("maestro"));
    }

    #[test]
    fn user_config_file_lives_in_config_dir() {
        let file = user_config_file();
        assert_eq!(file.file_name().unwrap(), "config.toml");
        assert!(file.parent().unwrap().ends_with("maestro"));
    }

    #[test]
    fn config_dir_respects_xdg_env() {
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", "/tmp/maestro-test-config");
        }
        let path = config_dir();
        assert_eq!(path, PathBuf::from("/tmp/maestro-test-config/maestro"));
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    fn snapshot_file_respects_xdg_data_env() {
        unsafe {
            std::env::set_var("XDG_DATA_HOME", "/tmp/maestro-test-data");
        }
        let path = default_snapshot_file();
        assert_eq!(path, PathBuf::from("/tmp/maestro-test-data/maestro/state.json"));
        unsafe {
            std::env::remove_var("XDG_DATA_HOME");
        }
    }
}
