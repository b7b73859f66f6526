//! Configuration file management for the warden CLI.
//!
//! Provides a TOML-based config file at `~/.config/warden/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use warden_core::CoreConfig;
use warden_store::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    /// Core tunables; every key optional.
    #[serde(default)]
    pub core: CoreConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the warden config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/warden` or `~/.config/warden`.
/// The platform-specific `dirs::config_dir()` is intentionally ignored
/// (it resolves to `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("warden");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("warden")
}

/// Return the path to the warden config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct WardenConfig {
    pub db_config: DbConfig,
    pub core: CoreConfig,
}

impl WardenConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > `WARDEN_DATABASE_URL` env > config file > default.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_string()
        } else if let Ok(url) = std::env::var("WARDEN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };

        let core = file_config.map(|cfg| cfg.core).unwrap_or_default();

        Ok(Self {
            db_config: DbConfig::new(db_url),
            core,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_roundtrip() {
        let original = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://testhost:5432/warden_test".to_string(),
            },
            core: CoreConfig::default(),
        };

        let contents = toml::to_string_pretty(&original).unwrap();
        let loaded: ConfigFile = toml::from_str(&contents).unwrap();
        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.core.max_workers, 10);
    }

    #[test]
    fn config_file_core_section_is_optional() {
        let contents = "[database]\nurl = \"postgresql://h:5432/w\"\n";
        let loaded: ConfigFile = toml::from_str(contents).unwrap();
        assert_eq!(loaded.core.dispatcher_tick_ms, 100);
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("warden/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn resolve_with_cli_flag_wins() {
        let config = WardenConfig::resolve(Some("postgresql://cli:5432/clidb")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
    }
}
