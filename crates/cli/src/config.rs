//! Command-line configuration

use anyhow::{Context, Result, anyhow};
use connection::{ClientConfig, RusbOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SYSTEM_CONFIG: &str = "/etc/tspl-usb/config.toml";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    /// Which printer to talk to and how
    #[serde(default)]
    pub printer: ClientConfig,
    /// libusb tunables
    #[serde(default)]
    pub usb: RusbOptions,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl CliConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand(&p),
            None => [Self::default_path(), PathBuf::from(SYSTEM_CONFIG)]
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CliConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!(
            "Loaded configuration from {}: printer {}",
            config_path.display(),
            config.printer.identity()
        );
        Ok(config)
    }

    /// Load configuration or return defaults if none is found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // logging is not initialized yet
                eprintln!("Config: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tspl-usb").join("config.toml")
        } else {
            PathBuf::from(".config/tspl-usb/config.toml")
        }
    }

    fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }

        self.printer
            .validate()
            .context("Invalid [printer] endpoints")?;

        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("usb.transfer_timeout_ms must be greater than 0"));
        }
        if self.usb.read_buffer_size == 0 {
            return Err(anyhow!("usb.read_buffer_size must be greater than 0"));
        }

        Ok(())
    }
}

/// Expand a leading `~` to the home directory
fn expand(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(raw) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connection::ErrorPolicy;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.printer.vendor_id, 0x1203);
        assert_eq!(config.printer.product_id, 0x0172);
        assert_eq!(config.usb.transfer_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CliConfig::default();
        config.printer.product_id = 0x0200;
        config.printer.error_policy = ErrorPolicy::Propagate;
        config.logging.level = "debug".to_string();
        config.save(&path).unwrap();

        let loaded = CliConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.printer, config.printer);
        assert_eq!(loaded.usb, config.usb);
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[printer]
product_id = 0x0172

[usb]
read_poll_ms = 250
"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(path)).unwrap();
        assert_eq!(config.printer.vendor_id, 0x1203);
        assert_eq!(config.printer.endpoints.write, 0x01);
        assert_eq!(config.usb.read_poll_ms, 250);
        assert_eq!(config.usb.read_buffer_size, 512);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[logging]\nlevel = \"loud\"\n").unwrap();

        let err = CliConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid log level"));
    }

    #[test]
    fn test_swapped_endpoints_rejected() {
        let mut config = CliConfig::default();
        config.printer = config.printer.with_endpoints(0x82, 0x01);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = CliConfig::default();
        config.usb.transfer_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(CliConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand(Path::new("~/tspl.toml")), home.join("tspl.toml"));
        }
        assert_eq!(expand(Path::new("/tmp/x.toml")), PathBuf::from("/tmp/x.toml"));
    }
}
