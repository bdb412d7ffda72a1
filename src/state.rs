//! Session state of a camera handle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionKind;
use crate::{OurError, OurResult};

/// Which background sessions a handle is running.
///
/// Streaming and recording are independent, so both may be active at once.
/// Every change goes through [`CameraState::start`] or [`CameraState::stop`],
/// which validate the transition against the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    #[default]
    Idle,
    Streaming,
    Recording,
    StreamingAndRecording,
    Released,
}

impl CameraState {
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            CameraState::Streaming | CameraState::StreamingAndRecording
        )
    }

    pub fn is_recording(self) -> bool {
        matches!(
            self,
            CameraState::Recording | CameraState::StreamingAndRecording
        )
    }

    pub fn is_running(self, kind: SessionKind) -> bool {
        match kind {
            SessionKind::Stream => self.is_streaming(),
            SessionKind::Record => self.is_recording(),
        }
    }

    pub fn is_released(self) -> bool {
        self == CameraState::Released
    }

    /// State after starting a `kind` session
    pub fn start(self, kind: SessionKind) -> OurResult<Self> {
        if self.is_released() {
            return Err(OurError::NotRunning(
                "camera has been released".to_string(),
            ));
        }
        if self.is_running(kind) {
            return Err(OurError::AlreadyRunning(kind));
        }
        Ok(match (self, kind) {
            (CameraState::Recording, SessionKind::Stream)
            | (CameraState::Streaming, SessionKind::Record) => CameraState::StreamingAndRecording,
            (_, SessionKind::Stream) => CameraState::Streaming,
            (_, SessionKind::Record) => CameraState::Recording,
        })
    }

    /// State after a `kind` session ended; unchanged if it was not running
    pub fn stop(self, kind: SessionKind) -> Self {
        match (self, kind) {
            (CameraState::Streaming, SessionKind::Stream)
            | (CameraState::Recording, SessionKind::Record) => CameraState::Idle,
            (CameraState::StreamingAndRecording, SessionKind::Stream) => CameraState::Recording,
            (CameraState::StreamingAndRecording, SessionKind::Record) => CameraState::Streaming,
            (state, _) => state,
        }
    }
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Idle => "idle",
            CameraState::Streaming => "streaming",
            CameraState::Recording => "recording",
            CameraState::StreamingAndRecording => "streaming+recording",
            CameraState::Released => "released",
        };
        write!(f, "{name}")
    }
}
