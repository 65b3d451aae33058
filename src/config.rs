use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::analyzer::AnalysisSettings;
use crate::extract::DEFAULT_PROGRESS_EVERY;

/// Application configuration loaded from TOML config file.
/// All fields have defaults; the config file is optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Pose model identity used as the second half of the cache key.
    pub model_id: String,
    pub model_version: String,
    /// Number of parallel workers for hashing and import. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Pause between frames when replaying a pose file as a live source.
    pub frame_delay_ms: u64,
    /// Frames between progress events during extraction.
    pub progress_every: u64,
    /// Angle, phase and rep tuning.
    pub analysis: AnalysisSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            model_id: "blazepose".to_string(),
            model_version: String::new(),
            workers: 0,
            frame_delay_ms: 0,
            progress_every: DEFAULT_PROGRESS_EVERY,
            analysis: AnalysisSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/swingcount/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match Self::from_toml(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("swingcount.db")
    } else {
        // Fallback: current directory
        PathBuf::from("swingcount.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.model_id, "blazepose");
        assert_eq!(config.progress_every, DEFAULT_PROGRESS_EVERY);
        assert_eq!(config.analysis, AnalysisSettings::default());
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_partial_analysis_table() {
        let config = AppConfig::from_toml(
            r#"
            model_id = "movenet"
            frame_delay_ms = 33

            [analysis]
            min_keypoint_confidence = 0.5

            [analysis.phase]
            confirm_frames = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.model_id, "movenet");
        assert_eq!(config.frame_delay_ms, 33);
        assert_eq!(config.analysis.min_keypoint_confidence, 0.5);
        assert_eq!(config.analysis.phase.confirm_frames, 3);
        assert_eq!(config.analysis.phase.noise_band_degrees, 20.0);
    }

    #[test]
    fn test_bad_type_is_an_error() {
        assert!(AppConfig::from_toml("workers = \"many\"").is_err());
    }

    #[test]
    fn test_resolve_workers() {
        let config = AppConfig { workers: 3, ..AppConfig::default() };
        assert_eq!(config.resolve_workers(), 3);
        assert!(AppConfig::default().resolve_workers() >= 1);
    }
}
