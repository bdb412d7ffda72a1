#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod frame;
pub mod handle;
pub(crate) mod session;
pub mod settings;
pub mod state;
pub mod synthetic;
#[cfg(feature = "usb")]
pub mod usb_camera;
pub mod video;

pub use config::{CameraProfile, ControllerConfig, UserConfig};
pub use controller::CameraController;
pub use device::{CaptureDevice, DeviceBackend, DeviceDescriptor};
pub use error::{OurError, OurResult, SessionKind};
pub use frame::{ChannelOrder, Frame, Photo};
pub use handle::{CameraHandle, CameraInfo};
pub use settings::{CameraSettings, CameraSettingsBuilder, Resolution};
pub use state::CameraState;
