use anyhow::{Context, Result};
use maestro_core::MaestroConfig;
use std::path::{Path, PathBuf};
use toml::Value;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<MaestroConfig> {
        let mut merged = Value::Table(Default::default());

        // Layer 1: User config
        let user_path = Self::user_config_path();
        if let Some(user) = Self::read_layer(&user_path)? {
            merge_values(&mut merged, user);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if let Some(project) = Self::read_layer(&project_path)? {
            merge_values(&mut merged, project);
        }

        Self::finalize(merged)
    }

    /// Get user config path ($XDG_CONFIG_HOME/maestro/config.toml)
    pub fn user_config_path() -> PathBuf {
        maestro_paths::user_config_file()
    }

    /// Get project config path
    /// Can be overridden with MAESTRO_PROJECT_CONFIG_DIR env var (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("MAESTRO_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".maestro/config.toml")
        }
    }

    fn read_layer(path: &Path) -> Result<Option<Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value: Value =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    /// Deserialize the merged tables, filling every unset field with its default
    fn finalize(merged: Value) -> Result<MaestroConfig> {
        let config = merged
            .try_into()
            .context("merged configuration does not match the expected schema")?;
        Ok(config)
    }

    /// Load config from a specific path (for testing)
    #[cfg(test)]
    pub fn load_from_path(path: &Path) -> Result<MaestroConfig> {
        match Self::read_layer(path)? {
            Some(value) => Self::finalize(value),
            None => Ok(MaestroConfig::default()),
        }
    }
}

/// Overlay `overlay` onto `base`; tables merge key by key, anything else replaces
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base), Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn parse(s: &str) -> Value {
        toml::from_str(s).unwrap()
    }

    // ==================== Merge Tests ====================

    #[test]
    fn test_merge_overlay_wins_per_key() {
        let mut base = parse("[spawner]\nmax_instances = 5\nspawn_delay_ms = 10\n");
        merge_values(&mut base, parse("[spawner]\nmax_instances = 2\n"));

        let config: MaestroConfig = base.try_into().unwrap();
        assert_eq!(config.spawner.max_instances, 2);
        assert_eq!(config.spawner.spawn_delay_ms, 10);
    }

    #[test]
    fn test_merge_keeps_sections_only_in_base() {
        let mut base = parse("[bus]\nmax_history = 50\n");
        merge_values(&mut base, parse("[state]\nmax_message_history = 7\n"));

        let config: MaestroConfig = base.try_into().unwrap();
        assert_eq!(config.bus.max_history, 50);
        assert_eq!(config.state.max_message_history, 7);
    }

    #[test]
    fn test_merge_replaces_arrays_whole() {
        let mut base = parse(
            r#"
[[spawner.default_fleet]]
id = "a"
agent_type = "local"

[[spawner.default_fleet]]
id = "b"
agent_type = "local"
"#,
        );
        merge_values(
            &mut base,
            parse("[[spawner.default_fleet]]\nid = \"solo\"\nagent_type = \"monitor\"\n"),
        );

        let config: MaestroConfig = base.try_into().unwrap();
        assert_eq!(config.spawner.default_fleet.len(), 1);
        assert_eq!(config.spawner.default_fleet[0].id, "solo");
    }

    // ==================== Load Tests ====================

    #[test]
    fn test_load_from_missing_path_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_from_path(&temp_dir.path().join("none.toml")).unwrap();
        assert_eq!(config, MaestroConfig::default());
    }

    #[test]
    fn test_load_from_path_rejects_bad_types() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[spawner]\nmax_instances = \"many\"\n").unwrap();

        assert!(ConfigLoader::load_from_path(&path).is_err());
    }

    #[test]
    #[serial]
    fn test_project_config_dir_override() {
        let temp_dir = TempDir::new().unwrap();
        // SAFETY: serialized with every other test touching the environment
        unsafe { std::env::set_var("MAESTRO_PROJECT_CONFIG_DIR", temp_dir.path()) };

        let path = ConfigLoader::project_config_path();

        unsafe { std::env::remove_var("MAESTRO_PROJECT_CONFIG_DIR") };
        assert_eq!(path, temp_dir.path().join("config.toml"));
    }

    #[test]
    #[serial]
    fn test_load_layers_project_over_user() {
        let user_home = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let user_dir = user_home.path().join("maestro");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(
            user_dir.join("config.toml"),
            "[spawner]\nmax_instances = 4\nspawn_delay_ms = 0\n",
        )
        .unwrap();
        std::fs::write(
            project.path().join("config.toml"),
            "[spawner]\nmax_instances = 2\n",
        )
        .unwrap();

        // SAFETY: serialized with every other test touching the environment
        unsafe {
            std::env::set_var("XDG_CONFIG_HOME", user_home.path());
            std::env::set_var("MAESTRO_PROJECT_CONFIG_DIR", project.path());
        }
        let config = ConfigLoader::load();
        unsafe {
            std::env::remove_var("XDG_CONFIG_HOME");
            std::env::remove_var("MAESTRO_PROJECT_CONFIG_DIR");
        }

        let config = config.unwrap();
        assert_eq!(config.spawner.max_instances, 2);
        assert_eq!(config.spawner.spawn_delay_ms, 0);
        assert_eq!(config.bus, maestro_core::BusConfig::default());
    }
}
