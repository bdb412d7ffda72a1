//! USB cameras through nokhwa.
//!
//! Devices are opened with the platform's native capture API and asked for
//! MJPEG at the closest format to the requested settings. Controls the device
//! does not expose are skipped with a warning; the handle scales frames to the
//! requested resolution whatever the device ends up delivering.

use image::RgbImage;
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{
        ApiBackend, CameraFormat, CameraIndex, ControlValueDescription, ControlValueSetter,
        FrameFormat, KnownCameraControl, RequestedFormat, RequestedFormatType,
        Resolution as NokhwaResolution,
    },
};
use tracing::{debug, error, info, warn};

use crate::device::{CaptureDevice, DeviceBackend, DeviceDescriptor};
use crate::settings::CameraSettings;
use crate::{OurError, OurResult};

/// Backend over the cameras attached to this machine
#[derive(Debug, Clone, Copy)]
pub struct UsbBackend {
    backend: ApiBackend,
}

impl UsbBackend {
    pub fn new() -> OurResult<Self> {
        Ok(Self {
            backend: Self::select_best_backend()?,
        })
    }

    /// Select the best API backend for the current platform
    fn select_best_backend() -> OurResult<ApiBackend> {
        #[cfg(target_os = "linux")]
        return Ok(ApiBackend::Video4Linux);

        #[cfg(target_os = "windows")]
        return Ok(ApiBackend::MediaFoundation);

        #[cfg(target_os = "macos")]
        return Ok(ApiBackend::AVFoundation);

        #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
        {
            error!(
                "Unsupported platform for USB camera access - only Linux, Windows, and macOS are supported"
            );
            Err(OurError::DeviceUnavailable(
                "Unsupported platform for USB camera access".to_string(),
            ))
        }
    }
}

impl DeviceBackend for UsbBackend {
    fn enumerate(&self) -> OurResult<Vec<DeviceDescriptor>> {
        info!("Detecting USB cameras with backend: {:?}", self.backend);

        let cameras = nokhwa::query(self.backend).map_err(|e| {
            error!("Failed to query cameras: {e}");
            OurError::DeviceUnavailable(format!("Failed to query cameras: {e}"))
        })?;

        let devices: Vec<DeviceDescriptor> = cameras
            .iter()
            .enumerate()
            .map(|(position, camera)| {
                let index = camera.index().as_index().unwrap_or(position as u32);
                DeviceDescriptor::from_description(
                    index,
                    &camera.human_name(),
                    &camera.description(),
                )
            })
            .collect();

        info!("Detected {} USB cameras", devices.len());
        Ok(devices)
    }

    fn open(&self, index: u32, settings: &CameraSettings) -> OurResult<Box<dyn CaptureDevice>> {
        let resolution = settings.resolution();
        let camera_format = CameraFormat::new(
            NokhwaResolution::new(resolution.width, resolution.height),
            FrameFormat::MJPEG,
            settings.fps(),
        );
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(camera_format));

        let mut camera = Camera::new(CameraIndex::Index(index), format).map_err(|e| {
            OurError::DeviceUnavailable(format!("Failed to open camera {index}: {e}"))
        })?;
        camera.open_stream().map_err(|e| {
            OurError::DeviceUnavailable(format!("Failed to open camera {index} stream: {e}"))
        })?;

        let name = camera.info().human_name();
        let mut device = UsbDevice { index, name, camera };
        device.apply(settings)?;

        let actual = device.camera.camera_format();
        info!(
            "Camera {index} streaming {}x{} {:?} at {}fps",
            actual.width(),
            actual.height(),
            actual.format(),
            actual.frame_rate()
        );
        Ok(Box::new(device))
    }
}

struct UsbDevice {
    index: u32,
    name: String,
    camera: Camera,
}

impl UsbDevice {
    /// Map a 0-100 percentage onto the control's integer range
    fn set_percentage(&mut self, control: KnownCameraControl, percent: u8) {
        let (min, max) = match self.camera.camera_control(control) {
            Ok(current) => match current.description() {
                ControlValueDescription::IntegerRange { min, max, .. } => (*min, *max),
                other => {
                    debug!("Camera {} {control:?} is not an integer range: {other:?}", self.index);
                    return;
                }
            },
            Err(e) => {
                warn!("Camera {} does not expose {control:?}: {e}", self.index);
                return;
            }
        };

        let value = min + (max - min) * i64::from(percent) / 100;
        if let Err(e) = self
            .camera
            .set_camera_control(control, ControlValueSetter::Integer(value))
        {
            warn!("Failed to set {control:?} on camera {}: {e}", self.index);
        }
    }
}

impl CaptureDevice for UsbDevice {
    fn read(&mut self) -> OurResult<RgbImage> {
        let index = self.index;
        let frame = self.camera.frame().map_err(|e| {
            OurError::ReadFailure(format!("Failed to capture frame from camera {index}: {e}"))
        })?;
        frame.decode_image::<RgbFormat>().map_err(|e| {
            OurError::ReadFailure(format!("Failed to decode frame from camera {index}: {e}"))
        })
    }

    fn apply(&mut self, settings: &CameraSettings) -> OurResult<()> {
        let resolution = settings.resolution();
        if let Err(e) = self
            .camera
            .set_resolution(NokhwaResolution::new(resolution.width, resolution.height))
        {
            warn!(
                "Camera {} rejected resolution {resolution}, frames will be scaled: {e}",
                self.index
            );
        }
        if let Err(e) = self.camera.set_frame_rate(settings.fps()) {
            warn!("Camera {} rejected {}fps: {e}", self.index, settings.fps());
        }

        self.set_percentage(KnownCameraControl::Brightness, settings.brightness());
        self.set_percentage(KnownCameraControl::Contrast, settings.contrast());
        self.set_percentage(KnownCameraControl::Saturation, settings.saturation());

        if let Some(exposure) = settings.exposure()
            && let Err(e) = self.camera.set_camera_control(
                KnownCameraControl::Exposure,
                ControlValueSetter::Integer(exposure.round() as i64),
            )
        {
            warn!("Failed to set exposure on camera {}: {e}", self.index);
        }
        if !settings.autofocus() {
            debug!("Camera {}: autofocus is not controllable through this backend", self.index);
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!("Failed to stop camera {} stream: {e}", self.index);
        }
        debug!("Closed camera {}", self.index);
    }
}
