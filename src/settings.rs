//! Acquisition settings for a capture device.
//!
//! A [`CameraSettings`] value is validated once when it is built and never
//! mutated afterwards. Reconfiguring a camera means building a new value and
//! handing it to [`crate::handle::CameraHandle::update_settings`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{OurError, OurResult};

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = OurError;

    /// Parses `WIDTHxHEIGHT`, e.g. `1280x720`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width, height) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| OurError::InvalidConfiguration(format!("Bad resolution '{s}'")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| OurError::InvalidConfiguration(format!("Bad resolution '{s}': {e}")))
        };
        Ok(Self::new(parse(width)?, parse(height)?))
    }
}

/// Immutable snapshot of acquisition parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CameraSettingsBuilder", into = "CameraSettingsBuilder")]
pub struct CameraSettings {
    resolution: Resolution,
    fps: u32,
    brightness: u8,
    contrast: u8,
    saturation: u8,
    exposure: Option<f64>,
    autofocus: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            resolution: Resolution::new(1920, 1080),
            fps: 30,
            brightness: 50,
            contrast: 50,
            saturation: 50,
            exposure: None,
            autofocus: true,
        }
    }
}

impl CameraSettings {
    /// Default settings at the given resolution and frame rate
    pub fn new(width: u32, height: u32, fps: u32) -> OurResult<Self> {
        Self::builder()
            .with_resolution(width, height)
            .with_fps(fps)
            .build()
    }

    pub fn builder() -> CameraSettingsBuilder {
        CameraSettingsBuilder::default()
    }

    /// Start a builder from these values, for deriving a replacement snapshot
    pub fn to_builder(&self) -> CameraSettingsBuilder {
        CameraSettingsBuilder::from(self.clone())
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    pub fn contrast(&self) -> u8 {
        self.contrast
    }

    pub fn saturation(&self) -> u8 {
        self.saturation
    }

    /// Manual exposure value, `None` when exposure is automatic
    pub fn exposure(&self) -> Option<f64> {
        self.exposure
    }

    pub fn autofocus(&self) -> bool {
        self.autofocus
    }

    /// Time between frames at the configured rate
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(1) / self.fps
    }
}

/// Builder for [`CameraSettings`]; every field starts at the default value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettingsBuilder {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub brightness: u8,
    pub contrast: u8,
    pub saturation: u8,
    pub exposure: Option<f64>,
    pub autofocus: bool,
}

impl Default for CameraSettingsBuilder {
    fn default() -> Self {
        CameraSettingsBuilder::from(CameraSettings::default())
    }
}

impl From<CameraSettings> for CameraSettingsBuilder {
    fn from(settings: CameraSettings) -> Self {
        Self {
            width: settings.resolution.width,
            height: settings.resolution.height,
            fps: settings.fps,
            brightness: settings.brightness,
            contrast: settings.contrast,
            saturation: settings.saturation,
            exposure: settings.exposure,
            autofocus: settings.autofocus,
        }
    }
}

impl TryFrom<CameraSettingsBuilder> for CameraSettings {
    type Error = OurError;

    fn try_from(builder: CameraSettingsBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

impl CameraSettingsBuilder {
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Brightness on a 0-100 scale
    pub fn with_brightness(mut self, brightness: u8) -> Self {
        self.brightness = brightness;
        self
    }

    /// Contrast on a 0-100 scale
    pub fn with_contrast(mut self, contrast: u8) -> Self {
        self.contrast = contrast;
        self
    }

    /// Saturation on a 0-100 scale
    pub fn with_saturation(mut self, saturation: u8) -> Self {
        self.saturation = saturation;
        self
    }

    /// Manual exposure; `None` switches back to automatic exposure
    pub fn with_exposure(mut self, exposure: Option<f64>) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_autofocus(mut self, autofocus: bool) -> Self {
        self.autofocus = autofocus;
        self
    }

    /// Validate and freeze the settings
    pub fn build(self) -> OurResult<CameraSettings> {
        if self.width == 0 || self.height == 0 {
            return Err(OurError::InvalidConfiguration(format!(
                "Resolution must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(OurError::InvalidConfiguration(
                "Frame rate must be positive".to_string(),
            ));
        }
        for (name, value) in [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("saturation", self.saturation),
        ] {
            if value > 100 {
                return Err(OurError::InvalidConfiguration(format!(
                    "{name} must be within 0-100, got {value}"
                )));
            }
        }
        if let Some(exposure) = self.exposure
            && (!exposure.is_finite() || exposure <= 0.0)
        {
            return Err(OurError::InvalidConfiguration(format!(
                "Exposure must be a positive number, got {exposure}"
            )));
        }

        Ok(CameraSettings {
            resolution: Resolution::new(self.width, self.height),
            fps: self.fps,
            brightness: self.brightness,
            contrast: self.contrast,
            saturation: self.saturation,
            exposure: self.exposure,
            autofocus: self.autofocus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_default() {
        let settings = CameraSettings::default();
        assert_eq!(settings.resolution(), Resolution::new(1920, 1080));
        assert_eq!(settings.fps(), 30);
        assert_eq!(settings.brightness(), 50);
        assert_eq!(settings.contrast(), 50);
        assert_eq!(settings.saturation(), 50);
        assert!(settings.exposure().is_none());
        assert!(settings.autofocus());
    }

    #[test]
    fn test_zero_resolution_rejected() {
        let result = CameraSettings::new(0, 0, 30);
        assert!(matches!(result, Err(OurError::InvalidConfiguration(_))));

        let result = CameraSettings::new(640, 0, 30);
        assert!(matches!(result, Err(OurError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_zero_fps_rejected() {
        let result = CameraSettings::new(640, 480, 0);
        assert!(matches!(result, Err(OurError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_percentages_bounded() {
        let result = CameraSettings::builder().with_brightness(101).build();
        assert!(matches!(
            result,
            Err(OurError::InvalidConfiguration(msg)) if msg.contains("brightness")
        ));

        let settings = CameraSettings::builder()
            .with_brightness(100)
            .with_contrast(0)
            .with_saturation(55)
            .build()
            .expect("Test operation should succeed");
        assert_eq!(settings.brightness(), 100);
        assert_eq!(settings.contrast(), 0);
        assert_eq!(settings.saturation(), 55);
    }

    #[test]
    fn test_exposure_must_be_positive() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = CameraSettings::builder().with_exposure(Some(bad)).build();
            assert!(result.is_err(), "exposure {bad} should be rejected");
        }
        let settings = CameraSettings::builder()
            .with_exposure(Some(120.0))
            .build()
            .expect("Test operation should succeed");
        assert_eq!(settings.exposure(), Some(120.0));
    }

    #[test]
    fn test_to_builder_derives_new_snapshot() {
        let original = CameraSettings::new(640, 480, 15).expect("Test operation should succeed");
        let updated = original
            .to_builder()
            .with_resolution(1280, 720)
            .build()
            .expect("Test operation should succeed");
        assert_eq!(original.resolution(), Resolution::new(640, 480));
        assert_eq!(updated.resolution(), Resolution::new(1280, 720));
        assert_eq!(updated.fps(), 15);
    }

    #[test]
    fn test_deserialization_validates() {
        let json = r#"{"width": 0, "height": 480, "fps": 30}"#;
        assert!(serde_json::from_str::<CameraSettings>(json).is_err());

        let json = r#"{"width": 320, "height": 240}"#;
        let settings: CameraSettings =
            serde_json::from_str(json).expect("Test operation should succeed");
        assert_eq!(settings.resolution(), Resolution::new(320, 240));
        assert_eq!(settings.fps(), 30);
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!(
            "1280x720"
                .parse::<Resolution>()
                .expect("Test operation should succeed"),
            Resolution::new(1280, 720)
        );
        assert!("1280".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
        assert_eq!(Resolution::new(640, 480).to_string(), "640x480");
    }

    #[test]
    fn test_frame_interval() {
        let settings = CameraSettings::new(320, 240, 20).expect("Test operation should succeed");
        assert_eq!(settings.frame_interval(), std::time::Duration::from_millis(50));
    }
}
