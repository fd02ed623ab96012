//! User configuration.
//!
//! Stored as JSON at `~/.config/peerpipe/config.json`. A missing file is
//! created with defaults on first load; out-of-range values fall back to
//! their defaults with a warning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peerpipe_protocol::{CONNECT_TIMEOUT, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, PROGRESS_STEP};
use peerpipe_transfer::TransferOptions;

/// On-disk format. Every field is optional so older files keep loading.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    listen_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    advertise_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    connect_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress_step: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address the sender listens on.
    pub listen_addr: String,
    /// Host advertised in the sender's identity instead of the bind address.
    pub advertise_host: Option<String>,
    pub chunk_size: u32,
    pub connect_timeout: Duration,
    pub progress_step: u8,
    /// Where received files go when no directory is given.
    pub output_dir: PathBuf,
    file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".into(),
            advertise_host: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: CONNECT_TIMEOUT,
            progress_step: PROGRESS_STEP,
            output_dir: PathBuf::from("."),
            file_path: config_file_path(),
        }
    }
}

impl Config {
    /// Loads the user's configuration, writing defaults if none exists.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_file_path())
    }

    pub fn load_from(file_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let file_path = file_path.into();
        let mut config = Config {
            file_path: file_path.clone(),
            ..Default::default()
        };

        if !file_path.exists() {
            config.save()?;
            tracing::info!(path = %file_path.display(), "created default configuration");
            return Ok(config);
        }

        let content = std::fs::read_to_string(&file_path)?;
        match serde_json::from_str::<ConfigFile>(&content) {
            Ok(file) => config.apply(file),
            Err(e) => tracing::warn!(
                path = %file_path.display(),
                "failed to parse config, using defaults: {e}"
            ),
        }
        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(addr) = file.listen_addr.filter(|a| !a.trim().is_empty()) {
            self.listen_addr = addr;
        }
        self.advertise_host = file.advertise_host.filter(|h| !h.trim().is_empty());

        match file.chunk_size {
            Some(size) if (1..=MAX_CHUNK_SIZE).contains(&size) => self.chunk_size = size,
            Some(size) => tracing::warn!(size, "chunk size out of range, using default"),
            None => {}
        }
        match file.connect_timeout_secs {
            Some(secs) if secs >= 1 => self.connect_timeout = Duration::from_secs(secs),
            Some(_) => tracing::warn!("connect timeout must be at least 1s, using default"),
            None => {}
        }
        match file.progress_step {
            Some(step) if (1..=100).contains(&step) => self.progress_step = step,
            Some(step) => tracing::warn!(step, "progress step out of range, using default"),
            None => {}
        }
        if let Some(dir) = file.output_dir {
            self.output_dir = dir;
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = ConfigFile {
            listen_addr: Some(self.listen_addr.clone()),
            advertise_host: self.advertise_host.clone(),
            chunk_size: Some(self.chunk_size),
            connect_timeout_secs: Some(self.connect_timeout.as_secs()),
            progress_step: Some(self.progress_step),
            output_dir: Some(self.output_dir.clone()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.file_path, json)?;

        tracing::debug!(path = %self.file_path.display(), "configuration saved");
        Ok(())
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            connect_timeout: self.connect_timeout,
            progress_step: self.progress_step,
        }
    }
}

fn config_file_path() -> PathBuf {
    config_base_dir().join("peerpipe").join("config.json")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                return PathBuf::from(xdg);
            }
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:0");
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.progress_step, 5);
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"connectTimeoutSecs\": 30"));
    }

    #[test]
    fn values_from_file_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"listenAddr":"127.0.0.1:7000","chunkSize":65536,"progressStep":10,"outputDir":"/srv/inbox"}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.progress_step, 10);
        assert_eq!(config.output_dir, PathBuf::from("/srv/inbox"));
        // Absent fields keep their defaults.
        assert_eq!(config.connect_timeout, CONNECT_TIMEOUT);
    }

    #[test]
    fn out_of_range_values_fall_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"chunkSize":0,"connectTimeoutSecs":0,"progressStep":200}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.connect_timeout, CONNECT_TIMEOUT);
        assert_eq!(config.progress_step, PROGRESS_STEP);
    }

    #[test]
    fn unparseable_file_uses_defaults_and_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::load_from(&path).unwrap();
        config.advertise_host = Some("192.168.1.20".into());
        config.connect_timeout = Duration::from_secs(90);
        config.save().unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn transfer_options_mirror_config() {
        let config = Config {
            chunk_size: 4096,
            progress_step: 25,
            ..Default::default()
        };
        let options = config.transfer_options();
        assert_eq!(options.chunk_size, 4096);
        assert_eq!(options.progress_step, 25);
        assert_eq!(options.connect_timeout, CONNECT_TIMEOUT);
    }
}
