//! Decoded frames handed to stream callbacks, recorders and photo callers.

use chrono::{DateTime, Utc};
use image::{RgbImage, imageops::FilterType};
use std::path::{Path, PathBuf};

use crate::settings::Resolution;
use crate::{OurError, OurResult};

/// Channel order of every frame produced by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
}

/// One decoded RGB image plus its position in the session that produced it
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, captured_at: DateTime<Utc>) -> Self {
        Self {
            image,
            sequence,
            captured_at,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    pub fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Sequence number within the originating session, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Packed `[R, G, B, R, G, B, ...]` pixel data, row major
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Encode the frame to `path`, the format being picked from the extension
    pub fn save(&self, path: &Path) -> OurResult<()> {
        self.image.save(path).map_err(|e| {
            OurError::WriteFailure(format!("Failed to write {}: {e}", path.display()))
        })
    }
}

/// Result of a synchronous capture.
///
/// The frame is always present; when a path was given, the outcome of
/// writing it is kept alongside so a failed write never loses the frame.
#[derive(Debug)]
pub struct Photo {
    frame: Frame,
    write: Option<OurResult<PathBuf>>,
}

impl Photo {
    pub(crate) fn new(frame: Frame, write: Option<OurResult<PathBuf>>) -> Self {
        Self { frame, write }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Outcome of writing the still, `None` if no path was requested
    pub fn write_result(&self) -> Option<&OurResult<PathBuf>> {
        self.write.as_ref()
    }

    /// Path the still was written to, or the write error.
    ///
    /// Fails with [`OurError::WriteFailure`] when no path was requested.
    pub fn saved(&self) -> OurResult<&Path> {
        match &self.write {
            Some(Ok(path)) => Ok(path),
            Some(Err(e)) => Err(OurError::WriteFailure(e.to_string())),
            None => Err(OurError::WriteFailure("No output path requested".to_string())),
        }
    }
}

/// Scale `image` to `target` unless it already has that size.
///
/// Devices may deliver a different size than requested; frames always leave
/// the controller at the resolution of the settings they were read under.
pub(crate) fn conform(image: RgbImage, target: Resolution) -> RgbImage {
    if image.width() == target.width && image.height() == target.height {
        return image;
    }
    image::imageops::resize(&image, target.width, target.height, FilterType::Triangle)
}
