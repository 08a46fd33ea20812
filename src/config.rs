//! Configuration management for verdict
//!
//! Stores settings in ~/.config/verdict/config.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default time limit for a test run, in seconds
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Window between SIGTERM and SIGKILL when a run is stopped
    #[serde(default = "default_grace_secs")]
    pub kill_grace_secs: u64,
    /// Rolling tail window for captured output, in bytes
    #[serde(default = "default_buffer_bytes")]
    pub capture_buffer_bytes: usize,
    /// Individual tests slower than this get a report callout
    #[serde(default = "default_slow_test_ms")]
    pub slow_test_threshold_ms: u64,
    /// Raw-output lines included in the report when failure detail is absent
    #[serde(default = "default_excerpt_lines")]
    pub report_excerpt_lines: usize,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_grace_secs() -> u64 {
    2
}

fn default_buffer_bytes() -> usize {
    1024 * 1024
}

fn default_slow_test_ms() -> u64 {
    500
}

fn default_excerpt_lines() -> usize {
    40
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            kill_grace_secs: default_grace_secs(),
            capture_buffer_bytes: default_buffer_bytes(),
            slow_test_threshold_ms: default_slow_test_ms(),
            report_excerpt_lines: default_excerpt_lines(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("verdict"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/verdict/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
