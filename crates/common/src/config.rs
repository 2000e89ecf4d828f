use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::types::{DEFAULT_SEGMENT_MODE, DEFAULT_SHM_DIR};

/// Top-level application config — loaded from config/config.toml
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub segment: SegmentConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Where segments live and how they are created and locked.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Directory backing the POSIX shm namespace (tmpfs on Linux).
    pub dir: String,
    /// Permission bits for newly created segments. Applied exactly, umask is ignored.
    pub mode: u32,
    /// Lock wait bound in milliseconds. 0 blocks forever. Measured on the wall
    /// clock; releasing a handle ignores it and always blocks.
    pub lock_timeout_ms: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            dir: DEFAULT_SHM_DIR.to_string(),
            mode: DEFAULT_SEGMENT_MODE,
            lock_timeout_ms: 0,
        }
    }
}

impl SegmentConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub name: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        anyhow::ensure!(
            config.segment.mode <= 0o777,
            "segment.mode {:o} has bits outside 0o777",
            config.segment.mode
        );
        Ok(config)
    }

    /// Load `path` if given, otherwise fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_deserialize() {
        let toml_str = r#"
[general]
log_level = "debug"

[segment]
dir = "/tmp/segments"
mode = 0o640
lock_timeout_ms = 250

[demo]
name = "calendar"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.segment.dir, "/tmp/segments");
        assert_eq!(config.segment.mode, 0o640);
        assert_eq!(
            config.segment.lock_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.demo.name, "calendar");
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: AppConfig = toml::from_str("[demo]\nname = \"x\"\n").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.segment.dir, DEFAULT_SHM_DIR);
        assert_eq!(config.segment.mode, DEFAULT_SEGMENT_MODE);
        assert_eq!(config.segment.lock_timeout(), None);
        assert_eq!(config.demo.name, "x");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[segment]\nlock_timeout_ms = 10").unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(
            config.segment.lock_timeout(),
            Some(Duration::from_millis(10))
        );

        let missing = file.path().with_extension("missing");
        assert!(AppConfig::load(&missing).is_err());
    }

    #[test]
    fn test_rejects_wide_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[segment]\nmode = 0o4777").unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = AppConfig::load_or_default(None).unwrap();
        assert_eq!(config.demo.name, "demo");
    }
}
