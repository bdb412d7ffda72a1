//! Capture device abstraction.
//!
//! A [`DeviceBackend`] knows how to enumerate and open devices by index; the
//! [`CaptureDevice`] it returns is the one physical binding a
//! [`crate::handle::CameraHandle`] owns and guards with its device lock.

use image::RgbImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::OurResult;
use crate::settings::CameraSettings;

/// An opened capture device
pub trait CaptureDevice: Send {
    /// Block until the device yields the next decoded frame
    fn read(&mut self) -> OurResult<RgbImage>;

    /// Push a settings snapshot to the hardware
    fn apply(&mut self, settings: &CameraSettings) -> OurResult<()>;

    /// Human readable device name for logs
    fn name(&self) -> String;
}

/// Enumerates and opens capture devices
pub trait DeviceBackend: Send + Sync {
    /// List devices currently attached
    fn enumerate(&self) -> OurResult<Vec<DeviceDescriptor>>;

    /// Bind the device at `index` and apply `settings` to it.
    ///
    /// Fails with [`crate::OurError::DeviceUnavailable`] when the index does
    /// not correspond to a live device.
    fn open(&self, index: u32, settings: &CameraSettings) -> OurResult<Box<dyn CaptureDevice>>;
}

/// Device information with hardware identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Index used to open the device
    pub index: u32,
    /// Camera name/model
    pub name: String,
    /// Backend supplied description
    pub description: String,
    /// Hardware vendor ID (USB VID)
    pub vendor_id: Option<String>,
    /// Hardware product ID (USB PID)
    pub product_id: Option<String>,
    /// Device serial number
    pub serial_number: Option<String>,
    /// Stable hardware-based identifier
    pub hardware_id: String,
}

static VENDOR_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)vid[_:]([0-9a-f]{4})").ok());
static PRODUCT_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)pid[_:]([0-9a-f]{4})").ok());
static SERIAL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)s[en]r?[_:]([0-9a-f]+)").ok());

fn capture_upper(regex: &LazyLock<Option<Regex>>, description: &str) -> Option<String> {
    regex
        .as_ref()?
        .captures(description)?
        .get(1)
        .map(|m| m.as_str().to_uppercase())
}

impl DeviceDescriptor {
    /// Build a descriptor, pulling VID/PID/serial out of the description when present
    pub fn from_description(index: u32, name: &str, description: &str) -> Self {
        let vendor_id = capture_upper(&VENDOR_ID, description);
        let product_id = capture_upper(&PRODUCT_ID, description);
        let serial_number = capture_upper(&SERIAL, description);

        let mut parts = vec!["usb".to_string()];
        if let (Some(vid), Some(pid)) = (&vendor_id, &product_id) {
            parts.push(format!("{vid}:{pid}"));
            match &serial_number {
                Some(serial) => parts.push(serial.clone()),
                None => parts.push(name.replace(' ', "_").to_lowercase()),
            }
        } else {
            let desc = description.replace(' ', "_").to_lowercase();
            parts.push(format!("{desc}:{index}"));
        }

        Self {
            index,
            name: name.to_string(),
            description: description.to_string(),
            vendor_id,
            product_id,
            serial_number,
            hardware_id: parts.join(":"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_with_usb_ids() {
        let descriptor =
            DeviceDescriptor::from_description(0, "WebEye HD", "USB VID_046d PID:0825 SN_ab12");
        assert_eq!(descriptor.vendor_id.as_deref(), Some("046D"));
        assert_eq!(descriptor.product_id.as_deref(), Some("0825"));
        assert_eq!(descriptor.serial_number.as_deref(), Some("AB12"));
        assert_eq!(descriptor.hardware_id, "usb:046D:0825:AB12");
    }

    #[test]
    fn test_descriptor_without_serial_uses_name() {
        let descriptor =
            DeviceDescriptor::from_description(1, "Front Camera", "vid:1234 pid:abcd");
        assert_eq!(descriptor.hardware_id, "usb:1234:ABCD:front_camera");
    }

    #[test]
    fn test_descriptor_fallback_to_description() {
        let descriptor = DeviceDescriptor::from_description(2, "cam", "Integrated Webcam");
        assert!(descriptor.vendor_id.is_none());
        assert_eq!(descriptor.hardware_id, "usb:integrated_webcam:2");
    }
}
