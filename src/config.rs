//! Configuration management for the camera controller.
//!
//! [`ControllerConfig`] holds the tunables that govern handles and sessions,
//! with `WEBEYE_*` environment variable overrides. [`UserConfig`] holds named
//! camera profiles read from a JSON file so a controller can be populated in
//! one call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::settings::{CameraSettings, Resolution};
use crate::{OurError, OurResult};

/// Controller tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Upper bound on how long a stop or release waits for session threads
    pub stop_timeout_ms: u64,
    /// Frames buffered per session before the acquisition loop drops frames for it
    pub frame_queue_depth: usize,
    /// JPEG quality for recorded video frames (1-100)
    pub jpeg_quality: u8,
    /// Device index used when a caller does not name one
    pub default_index: u32,
    /// Settings used when a caller does not supply any
    pub default_settings: CameraSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 2000,
            frame_queue_depth: 2,
            jpeg_quality: 85,
            default_index: 0,
            default_settings: CameraSettings::default(),
        }
    }
}

fn env_parse<T>(name: &str) -> OurResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| OurError::Config(format!("{name}={value}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl ControllerConfig {
    /// Defaults with environment variable overrides applied
    pub fn new() -> OurResult<Self> {
        let mut config = ControllerConfig::default();

        if let Some(timeout) = env_parse("WEBEYE_STOP_TIMEOUT_MS")? {
            config.stop_timeout_ms = timeout;
        }
        if let Some(depth) = env_parse("WEBEYE_FRAME_QUEUE_DEPTH")? {
            config.frame_queue_depth = depth;
        }
        if let Some(quality) = env_parse("WEBEYE_JPEG_QUALITY")? {
            config.jpeg_quality = quality;
        }
        if let Some(index) = env_parse("WEBEYE_DEFAULT_INDEX")? {
            config.default_index = index;
        }

        let resolution: Option<Resolution> = env_parse("WEBEYE_RESOLUTION")?;
        let fps: Option<u32> = env_parse("WEBEYE_FPS")?;
        if resolution.is_some() || fps.is_some() {
            let mut builder = config.default_settings.to_builder();
            if let Some(resolution) = resolution {
                builder = builder.with_resolution(resolution.width, resolution.height);
            }
            if let Some(fps) = fps {
                builder = builder.with_fps(fps);
            }
            config.default_settings = builder.build()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the handle cannot work with
    pub fn validate(&self) -> OurResult<()> {
        if self.stop_timeout_ms == 0 {
            return Err(OurError::Config(
                "stop_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.frame_queue_depth == 0 {
            return Err(OurError::Config(
                "frame_queue_depth must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(OurError::Config(format!(
                "jpeg_quality must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_frame_queue_depth(mut self, depth: usize) -> Self {
        self.frame_queue_depth = depth;
        self
    }

    /// Get the path to the user config file
    pub fn get_config_path() -> PathBuf {
        if let Ok(config_path_override) = env::var("WEBEYE_CONFIG_PATH") {
            return PathBuf::from(config_path_override);
        }

        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("webeye.json")
    }

    /// Load camera profiles, falling back to an empty config on any problem
    pub fn load_user_config() -> UserConfig {
        Self::load_user_config_from(&Self::get_config_path())
    }

    pub fn load_user_config_from(config_path: &Path) -> UserConfig {
        if !config_path.exists() {
            return UserConfig::default();
        }

        match fs::read_to_string(config_path) {
            Ok(contents) => match serde_json::from_str::<UserConfig>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse user config from {config_path:?}: {e}");
                    UserConfig::default()
                }
            },
            Err(e) => {
                warn!("Failed to read user config from {config_path:?}: {e}");
                UserConfig::default()
            }
        }
    }

    /// Save camera profiles to the user config file
    pub fn save_user_config(config: &UserConfig) -> OurResult<()> {
        Self::save_user_config_to(&Self::get_config_path(), config)
    }

    pub fn save_user_config_to(config_path: &Path, config: &UserConfig) -> OurResult<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(config)?;
        fs::write(config_path, contents)?;

        info!("Saved user config to {config_path:?}");
        Ok(())
    }
}

/// A camera the controller should register at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProfile {
    /// Device index to open
    pub index: u32,
    /// Settings applied when the device is opened
    #[serde(default)]
    pub settings: CameraSettings,
}

/// User configuration that persists across restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Camera profiles by id
    pub cameras: HashMap<String, CameraProfile>,
    /// Id of the camera to mark active after loading
    pub active: Option<String>,
}

impl UserConfig {
    /// Get the profile for a camera id
    pub fn get_camera(&self, camera_id: &str) -> Option<&CameraProfile> {
        self.cameras.get(camera_id)
    }

    /// Set the profile for a camera id
    pub fn set_camera(&mut self, camera_id: String, profile: CameraProfile) {
        self.cameras.insert(camera_id, profile);
    }

    /// Remove the profile for a camera id, clearing it as active if needed
    pub fn remove_camera(&mut self, camera_id: &str) {
        self.cameras.remove(camera_id);
        if self.active.as_deref() == Some(camera_id) {
            self.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_config_default() {
        let config = ControllerConfig::default();
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.frame_queue_depth, 2);
        assert_eq!(config.jpeg_quality, 85);
        assert_eq!(config.default_index, 0);
        assert_eq!(config.default_settings, CameraSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ControllerConfig::default().with_frame_queue_depth(0);
        assert!(matches!(config.validate(), Err(OurError::Config(_))));

        let config = ControllerConfig {
            jpeg_quality: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OurError::Config(_))));

        let config = ControllerConfig::default().with_stop_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(OurError::Config(_))));

        let config = ControllerConfig::default().with_stop_timeout(Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_user_config_save_and_load() {
        let dir = tempfile::tempdir().expect("Test operation should succeed");
        let path = dir.path().join("nested").join("webeye.json");

        assert_eq!(ControllerConfig::load_user_config_from(&path), UserConfig::default());

        let mut config = UserConfig::default();
        config.set_camera(
            "porch".to_string(),
            CameraProfile {
                index: 3,
                settings: CameraSettings::new(320, 240, 10).expect("Test operation should succeed"),
            },
        );
        config.active = Some("porch".to_string());
        ControllerConfig::save_user_config_to(&path, &config)
            .expect("Test operation should succeed");

        assert_eq!(ControllerConfig::load_user_config_from(&path), config);
    }

    #[test]
    fn test_unreadable_user_config_falls_back_to_empty() {
        let dir = tempfile::tempdir().expect("Test operation should succeed");
        let path = dir.path().join("webeye.json");
        fs::write(&path, "{not json").expect("Test operation should succeed");
        assert_eq!(ControllerConfig::load_user_config_from(&path), UserConfig::default());
    }

    #[test]
    fn test_user_config_camera_operations() {
        let mut config = UserConfig::default();
        let profile = CameraProfile {
            index: 2,
            settings: CameraSettings::new(1280, 720, 30).expect("Test operation should succeed"),
        };

        config.set_camera("kitchen".to_string(), profile.clone());
        config.active = Some("kitchen".to_string());
        assert_eq!(config.get_camera("kitchen"), Some(&profile));

        config.remove_camera("kitchen");
        assert!(config.get_camera("kitchen").is_none());
        assert!(config.active.is_none());
    }

    #[test]
    fn test_user_config_parsing() {
        let json = r#"{
            "cameras": {
                "table": {"index": 1, "settings": {"width": 640, "height": 480, "fps": 15}},
                "counter": {"index": 0}
            },
            "active": "table"
        }"#;
        let config: UserConfig = serde_json::from_str(json).expect("Test operation should succeed");
        assert_eq!(config.cameras.len(), 2);
        let table = config.get_camera("table").expect("Test operation should succeed");
        assert_eq!(table.settings.resolution(), Resolution::new(640, 480));
        assert_eq!(table.settings.fps(), 15);
        let counter = config.get_camera("counter").expect("Test operation should succeed");
        assert_eq!(counter.settings, CameraSettings::default());
        assert_eq!(config.active.as_deref(), Some("table"));
    }

    #[test]
    fn test_user_config_rejects_invalid_settings() {
        let json = r#"{"cameras": {"bad": {"index": 0, "settings": {"width": 0, "height": 0}}}}"#;
        assert!(serde_json::from_str::<UserConfig>(json).is_err());
    }

    #[test]
    fn test_serialization() {
        let config = ControllerConfig::default();
        let json = serde_json::to_string(&config).expect("Test operation should succeed");
        let deserialized: ControllerConfig =
            serde_json::from_str(&json).expect("Test operation should succeed");
        assert_eq!(config.stop_timeout_ms, deserialized.stop_timeout_ms);
        assert_eq!(config.default_settings, deserialized.default_settings);
    }
}
