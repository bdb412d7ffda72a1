//! Test-pattern devices.
//!
//! [`SyntheticBackend`] stands in for real hardware in tests and in the CLI's
//! `--synthetic` mode. Each device renders a gradient whose blue channel
//! carries the read counter, and can be told to fail or stall so the handle's
//! failure paths can be driven deterministically.

use image::RgbImage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::device::{CaptureDevice, DeviceBackend, DeviceDescriptor};
use crate::settings::{CameraSettings, Resolution};
use crate::{OurError, OurResult};

/// Shared switches and counters, observable from tests
#[derive(Debug, Default)]
pub struct DeviceMonitor {
    open_devices: AtomicUsize,
    reads: AtomicU64,
    stalled: AtomicBool,
    failing: AtomicBool,
}

impl DeviceMonitor {
    /// Devices opened and not yet dropped
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }

    /// Successful reads across every device of the backend
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// While set, every read blocks until it is cleared again
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// While set, every read fails with [`OurError::ReadFailure`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

/// Backend serving a fixed set of synthetic device indices
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    indices: Vec<u32>,
    read_delay: Duration,
    native: Option<Resolution>,
    monitor: Arc<DeviceMonitor>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            indices: vec![0],
            read_delay: Duration::ZERO,
            native: None,
            monitor: Arc::new(DeviceMonitor::default()),
        }
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device indices that exist on this backend
    pub fn with_devices(mut self, indices: impl IntoIterator<Item = u32>) -> Self {
        self.indices = indices.into_iter().collect();
        self
    }

    /// Time each read spends "exposing" before returning
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Deliver frames at this size regardless of the requested resolution
    pub fn with_native_resolution(mut self, resolution: Resolution) -> Self {
        self.native = Some(resolution);
        self
    }

    pub fn monitor(&self) -> Arc<DeviceMonitor> {
        self.monitor.clone()
    }
}

impl DeviceBackend for SyntheticBackend {
    fn enumerate(&self) -> OurResult<Vec<DeviceDescriptor>> {
        Ok(self
            .indices
            .iter()
            .map(|&index| {
                DeviceDescriptor::from_description(
                    index,
                    &format!("Synthetic Camera {index}"),
                    &format!("synthetic test pattern {index}"),
                )
            })
            .collect())
    }

    fn open(&self, index: u32, settings: &CameraSettings) -> OurResult<Box<dyn CaptureDevice>> {
        if !self.indices.contains(&index) {
            return Err(OurError::DeviceUnavailable(format!(
                "No synthetic device at index {index}"
            )));
        }

        let mut device = SyntheticDevice {
            index,
            resolution: settings.resolution(),
            native: self.native,
            read_delay: self.read_delay,
            counter: 0,
            monitor: self.monitor.clone(),
        };
        device.apply(settings)?;
        self.monitor.open_devices.fetch_add(1, Ordering::SeqCst);
        debug!("Opened synthetic device {index}");
        Ok(Box::new(device))
    }
}

struct SyntheticDevice {
    index: u32,
    resolution: Resolution,
    native: Option<Resolution>,
    read_delay: Duration,
    counter: u64,
    monitor: Arc<DeviceMonitor>,
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> OurResult<RgbImage> {
        while self.monitor.stalled.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        if self.monitor.failing.load(Ordering::SeqCst) {
            return Err(OurError::ReadFailure(format!(
                "Synthetic device {} returned no data",
                self.index
            )));
        }

        let size = self.native.unwrap_or(self.resolution);
        let tick = (self.counter % 256) as u8;
        self.counter += 1;
        self.monitor.reads.fetch_add(1, Ordering::SeqCst);

        Ok(RgbImage::from_fn(size.width, size.height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, tick])
        }))
    }

    fn apply(&mut self, settings: &CameraSettings) -> OurResult<()> {
        self.resolution = settings.resolution();
        Ok(())
    }

    fn name(&self) -> String {
        format!("synthetic:{}", self.index)
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.monitor.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_index_is_unavailable() {
        let backend = SyntheticBackend::new().with_devices([0, 1]);
        let settings = CameraSettings::new(8, 8, 30).expect("Test operation should succeed");
        assert!(matches!(
            backend.open(999, &settings),
            Err(OurError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn test_reads_follow_applied_settings() {
        let backend = SyntheticBackend::new();
        let settings = CameraSettings::new(8, 4, 30).expect("Test operation should succeed");
        let mut device = backend
            .open(0, &settings)
            .expect("Test operation should succeed");

        let first = device.read().expect("Test operation should succeed");
        assert_eq!((first.width(), first.height()), (8, 4));
        assert_eq!(first.get_pixel(0, 0).0[2], 0);

        let larger = CameraSettings::new(16, 12, 30).expect("Test operation should succeed");
        device.apply(&larger).expect("Test operation should succeed");
        let second = device.read().expect("Test operation should succeed");
        assert_eq!((second.width(), second.height()), (16, 12));
        assert_eq!(second.get_pixel(0, 0).0[2], 1);
    }

    #[test]
    fn test_monitor_tracks_open_devices_and_failures() {
        let backend = SyntheticBackend::new();
        let monitor = backend.monitor();
        let settings = CameraSettings::new(4, 4, 30).expect("Test operation should succeed");

        let mut device = backend
            .open(0, &settings)
            .expect("Test operation should succeed");
        assert_eq!(monitor.open_devices(), 1);

        monitor.set_failing(true);
        assert!(matches!(device.read(), Err(OurError::ReadFailure(_))));
        monitor.set_failing(false);
        assert!(device.read().is_ok());
        assert_eq!(monitor.reads(), 1);

        drop(device);
        assert_eq!(monitor.open_devices(), 0);
    }

    #[test]
    fn test_enumerate_lists_configured_indices() {
        let backend = SyntheticBackend::new().with_devices([0, 3]);
        let devices = backend.enumerate().expect("Test operation should succeed");
        let indices: Vec<u32> = devices.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 3]);
        assert_eq!(devices[1].name, "Synthetic Camera 3");
    }
}
