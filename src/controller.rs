//! Registry of named camera handles with an optional active camera.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, UserConfig};
use crate::device::{DeviceBackend, DeviceDescriptor};
use crate::frame::{Frame, Photo};
use crate::handle::{CameraHandle, CameraInfo};
use crate::settings::CameraSettings;
use crate::{OurError, OurResult};

/// Owns every handle it registers; dropping the controller releases them all
pub struct CameraController {
    backend: Box<dyn DeviceBackend>,
    config: ControllerConfig,
    cameras: HashMap<String, CameraHandle>,
    active: Option<String>,
}

impl std::fmt::Debug for CameraController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraController")
            .field("cameras", &self.cameras)
            .field("active", &self.active)
            .finish()
    }
}

impl CameraController {
    /// Controller over the system's USB cameras
    #[cfg(feature = "usb")]
    pub fn new(config: ControllerConfig) -> OurResult<Self> {
        Self::with_backend(Box::new(crate::usb_camera::UsbBackend::new()?), config)
    }

    pub fn with_backend(
        backend: Box<dyn DeviceBackend>,
        config: ControllerConfig,
    ) -> OurResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            cameras: HashMap::new(),
            active: None,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Devices the backend can currently see
    pub fn list_devices(&self) -> OurResult<Vec<DeviceDescriptor>> {
        self.backend.enumerate()
    }

    /// Open device `index` and register it under `camera_id`
    pub fn add_camera(
        &mut self,
        camera_id: impl Into<String>,
        index: u32,
        settings: CameraSettings,
    ) -> OurResult<()> {
        let camera_id = camera_id.into();
        if self.cameras.contains_key(&camera_id) {
            return Err(OurError::AlreadyRegistered(camera_id));
        }

        let handle = CameraHandle::open_with(self.backend.as_ref(), index, settings, &self.config)?;
        info!("Registered camera '{camera_id}' on device {index}");
        self.cameras.insert(camera_id, handle);
        Ok(())
    }

    /// Register every profile in `user_config` and apply its active camera.
    ///
    /// Profiles are opened in id order. The first failure stops loading; cameras
    /// registered before it stay registered.
    pub fn load_profiles(&mut self, user_config: &UserConfig) -> OurResult<()> {
        let mut ids: Vec<&String> = user_config.cameras.keys().collect();
        ids.sort();

        for camera_id in ids {
            if let Some(profile) = user_config.get_camera(camera_id) {
                self.add_camera(camera_id.clone(), profile.index, profile.settings.clone())?;
            }
        }

        if let Some(active) = &user_config.active {
            self.set_active(active)?;
        }
        Ok(())
    }

    pub fn get_camera(&self, camera_id: &str) -> OurResult<&CameraHandle> {
        self.cameras
            .get(camera_id)
            .ok_or_else(|| OurError::NotFound(camera_id.to_string()))
    }

    pub fn set_active(&mut self, camera_id: &str) -> OurResult<()> {
        if !self.cameras.contains_key(camera_id) {
            return Err(OurError::NotFound(camera_id.to_string()));
        }
        debug!("Active camera is now '{camera_id}'");
        self.active = Some(camera_id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Registered ids, sorted
    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Handle named by `camera_id`, or the active one when `None`
    fn resolve(&self, camera_id: Option<&str>) -> OurResult<&CameraHandle> {
        match camera_id {
            Some(camera_id) => self.get_camera(camera_id),
            None => {
                let active = self.active.as_deref().ok_or(OurError::NoActiveCamera)?;
                self.get_camera(active)
            }
        }
    }

    pub fn capture_photo(&self, camera_id: Option<&str>, path: Option<&Path>) -> OurResult<Photo> {
        self.resolve(camera_id)?.capture_photo(path)
    }

    pub fn start_stream<F>(&self, camera_id: Option<&str>, callback: F) -> OurResult<()>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        self.resolve(camera_id)?.start_stream(callback)
    }

    pub fn stop_stream(&self, camera_id: Option<&str>) -> OurResult<()> {
        self.resolve(camera_id)?.stop_stream();
        Ok(())
    }

    pub fn start_recording(&self, camera_id: Option<&str>, path: &Path) -> OurResult<()> {
        self.resolve(camera_id)?.start_recording(path)
    }

    pub fn stop_recording(&self, camera_id: Option<&str>) -> OurResult<()> {
        self.resolve(camera_id)?.stop_recording();
        Ok(())
    }

    pub fn update_settings(
        &self,
        camera_id: Option<&str>,
        settings: CameraSettings,
    ) -> OurResult<()> {
        self.resolve(camera_id)?.update_settings(settings)
    }

    pub fn info(&self, camera_id: Option<&str>) -> OurResult<CameraInfo> {
        Ok(self.resolve(camera_id)?.info())
    }

    /// Release one camera and forget it
    pub fn release(&mut self, camera_id: &str) -> OurResult<()> {
        let handle = self
            .cameras
            .remove(camera_id)
            .ok_or_else(|| OurError::NotFound(camera_id.to_string()))?;
        handle.release();
        if self.active.as_deref() == Some(camera_id) {
            self.active = None;
        }
        info!("Released camera '{camera_id}'");
        Ok(())
    }

    /// Release every camera and empty the registry. Safe on an empty registry.
    pub fn release_all(&mut self) {
        if self.cameras.is_empty() {
            return;
        }

        let count = self.cameras.len();
        for (camera_id, handle) in self.cameras.drain() {
            handle.release();
            if let Some(error) = handle.info().last_error {
                warn!("Camera '{camera_id}' released with error: {error}");
            }
        }
        self.active = None;
        info!("Released {count} cameras");
    }
}

impl Drop for CameraController {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraProfile;
    use crate::synthetic::SyntheticBackend;

    fn controller(devices: &[u32]) -> CameraController {
        CameraController::with_backend(
            Box::new(SyntheticBackend::new().with_devices(devices.to_vec())),
            ControllerConfig::default(),
        )
        .expect("Test operation should succeed")
    }

    fn small() -> CameraSettings {
        CameraSettings::new(64, 48, 30).expect("Test operation should succeed")
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut controller = controller(&[0, 1]);
        controller
            .add_camera("main", 0, small())
            .expect("Test operation should succeed");
        let result = controller.add_camera("main", 1, small());
        assert!(matches!(result, Err(OurError::AlreadyRegistered(id)) if id == "main"));
        assert_eq!(controller.camera_ids(), vec!["main".to_string()]);
    }

    #[test]
    fn test_forwarders_need_active_camera() {
        let mut controller = controller(&[0]);
        controller
            .add_camera("main", 0, small())
            .expect("Test operation should succeed");

        assert!(matches!(
            controller.capture_photo(None, None),
            Err(OurError::NoActiveCamera)
        ));
        assert!(matches!(controller.info(None), Err(OurError::NoActiveCamera)));

        controller
            .set_active("main")
            .expect("Test operation should succeed");
        let photo = controller
            .capture_photo(None, None)
            .expect("Test operation should succeed");
        assert_eq!(photo.frame().width(), 64);
        assert!(controller.capture_photo(Some("main"), None).is_ok());
    }

    #[test]
    fn test_unknown_ids() {
        let mut controller = controller(&[0]);
        assert!(matches!(controller.set_active("nope"), Err(OurError::NotFound(_))));
        assert!(matches!(controller.get_camera("nope"), Err(OurError::NotFound(_))));
        assert!(matches!(controller.release("nope"), Err(OurError::NotFound(_))));
        assert!(matches!(
            controller.stop_stream(Some("nope")),
            Err(OurError::NotFound(_))
        ));
    }

    #[test]
    fn test_release_clears_active() {
        let mut controller = controller(&[0]);
        controller
            .add_camera("main", 0, small())
            .expect("Test operation should succeed");
        controller
            .set_active("main")
            .expect("Test operation should succeed");

        controller
            .release("main")
            .expect("Test operation should succeed");
        assert!(controller.active_id().is_none());
        assert!(controller.camera_ids().is_empty());
    }

    #[test]
    fn test_load_profiles() {
        let mut user_config = UserConfig::default();
        user_config.set_camera(
            "left".to_string(),
            CameraProfile {
                index: 0,
                settings: small(),
            },
        );
        user_config.set_camera(
            "right".to_string(),
            CameraProfile {
                index: 1,
                settings: small(),
            },
        );
        user_config.active = Some("right".to_string());

        let mut controller = controller(&[0, 1]);
        controller
            .load_profiles(&user_config)
            .expect("Test operation should succeed");
        assert_eq!(controller.camera_ids(), vec!["left", "right"]);
        assert_eq!(controller.active_id(), Some("right"));
        let info = controller.info(None).expect("Test operation should succeed");
        assert_eq!(info.index, 1);
    }

    #[test]
    fn test_load_profiles_unknown_active() {
        let user_config = UserConfig {
            active: Some("ghost".to_string()),
            ..Default::default()
        };
        let mut controller = controller(&[0]);
        assert!(matches!(
            controller.load_profiles(&user_config),
            Err(OurError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_devices() {
        let controller = controller(&[0, 3]);
        let devices = controller
            .list_devices()
            .expect("Test operation should succeed");
        let indices: Vec<u32> = devices.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![0, 3]);
    }
}
