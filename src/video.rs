//! Motion-JPEG AVI writer used by record sessions.
//!
//! Frames are JPEG encoded and appended as `00dc` chunks inside a RIFF `AVI `
//! container. The header is written with zero counts when the file is created
//! and rewritten with the final counts by [`AviWriter::finish`], followed by
//! an `idx1` index so players can seek.

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::frame::conform;
use crate::settings::Resolution;
use crate::{OurError, OurResult};

/// Bytes before the first frame chunk: RIFF header, `hdrl` list, `movi` list header
const HEADER_LEN: u32 = 224;
/// Offset of the `movi` fourcc, the base for `idx1` offsets
const MOVI_FOURCC_OFFSET: u32 = 220;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
/// Largest width or height the `strh` frame rectangle can hold
const MAX_DIMENSION: u32 = u16::MAX as u32;

struct IndexEntry {
    offset: u32,
    size: u32,
}

/// Appends JPEG frames to an AVI file at a fixed resolution and frame rate
pub struct AviWriter {
    path: PathBuf,
    out: BufWriter<File>,
    resolution: Resolution,
    fps: u32,
    quality: u8,
    index: Vec<IndexEntry>,
    /// Bytes written after the `movi` fourcc
    movi_len: u32,
    largest_chunk: u32,
    last_jpeg: Option<Vec<u8>>,
}

impl AviWriter {
    /// Create `path` and write a provisional header.
    ///
    /// Fails with [`OurError::WriteFailure`] when `path` does not end in
    /// `.avi` or the file cannot be created, and with
    /// [`OurError::InvalidConfiguration`] for frames larger than AVI can
    /// describe. Nothing is created on failure.
    pub fn create(path: &Path, resolution: Resolution, fps: u32, quality: u8) -> OurResult<Self> {
        let is_avi = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("avi"));
        if !is_avi {
            return Err(OurError::WriteFailure(format!(
                "Recordings are Motion-JPEG AVI files, {} must end in .avi",
                path.display()
            )));
        }
        if resolution.width > MAX_DIMENSION || resolution.height > MAX_DIMENSION {
            return Err(OurError::InvalidConfiguration(format!(
                "{resolution} exceeds the {MAX_DIMENSION}px limit of MJPEG AVI"
            )));
        }

        let file = File::create(path).map_err(|e| {
            OurError::WriteFailure(format!("Failed to create {}: {e}", path.display()))
        })?;

        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            resolution,
            fps,
            quality: quality.clamp(1, 100),
            index: Vec::new(),
            movi_len: 4,
            largest_chunk: 0,
            last_jpeg: None,
        };
        let header = writer.header();
        writer.write_all(&header)?;
        debug!(
            "Opened AVI sink {} at {}@{}fps",
            writer.path.display(),
            resolution,
            fps
        );
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> usize {
        self.index.len()
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Encode and append one frame, scaling it to the sink resolution if needed
    pub fn write_frame(&mut self, image: &RgbImage) -> OurResult<()> {
        let image = if image.width() != self.resolution.width
            || image.height() != self.resolution.height
        {
            conform(image.clone(), self.resolution)
        } else {
            image.clone()
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&image)
            .map_err(|e| OurError::WriteFailure(format!("Failed to encode frame: {e}")))?;

        self.append_chunk(&jpeg)?;
        self.last_jpeg = Some(jpeg);
        Ok(())
    }

    /// Append the previous frame `count` more times, holding it on screen
    /// for `count` extra frame slots. No-op before the first frame.
    pub fn repeat_last(&mut self, count: u64) -> OurResult<()> {
        let Some(jpeg) = self.last_jpeg.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        for _ in 0..count {
            result = self.append_chunk(&jpeg);
            if result.is_err() {
                break;
            }
        }
        self.last_jpeg = Some(jpeg);
        result
    }

    fn append_chunk(&mut self, jpeg: &[u8]) -> OurResult<()> {
        let size = u32::try_from(jpeg.len())
            .map_err(|_| OurError::WriteFailure("Encoded frame too large".to_string()))?;
        let padded = size + (size & 1);
        if u64::from(HEADER_LEN) + u64::from(self.movi_len) + 8 + u64::from(padded)
            > u64::from(u32::MAX)
        {
            return Err(OurError::WriteFailure(format!(
                "{} exceeds the AVI size limit",
                self.path.display()
            )));
        }

        let mut chunk = Vec::with_capacity(8 + padded as usize);
        chunk.extend_from_slice(b"00dc");
        chunk.extend_from_slice(&size.to_le_bytes());
        chunk.extend_from_slice(jpeg);
        if size & 1 == 1 {
            chunk.push(0);
        }
        self.write_all(&chunk)?;

        self.index.push(IndexEntry {
            offset: self.movi_len,
            size,
        });
        self.movi_len += 8 + padded;
        self.largest_chunk = self.largest_chunk.max(size);
        Ok(())
    }

    /// Write the index, patch the header with final counts and close the file
    pub fn finish(mut self) -> OurResult<PathBuf> {
        let mut idx = Vec::with_capacity(8 + self.index.len() * 16);
        idx.extend_from_slice(b"idx1");
        idx.extend_from_slice(&((self.index.len() * 16) as u32).to_le_bytes());
        for entry in &self.index {
            idx.extend_from_slice(b"00dc");
            idx.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
            idx.extend_from_slice(&entry.offset.to_le_bytes());
            idx.extend_from_slice(&entry.size.to_le_bytes());
        }
        self.write_all(&idx)?;

        let header = self.header();
        self.out
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.out.write_all(&header))
            .and_then(|_| self.out.flush())
            .map_err(|e| {
                OurError::WriteFailure(format!("Failed to finalize {}: {e}", self.path.display()))
            })?;

        debug!(
            "Closed AVI sink {} with {} frames",
            self.path.display(),
            self.index.len()
        );
        Ok(self.path)
    }

    fn write_all(&mut self, bytes: &[u8]) -> OurResult<()> {
        self.out.write_all(bytes).map_err(|e| {
            OurError::WriteFailure(format!("Failed to write {}: {e}", self.path.display()))
        })
    }

    fn header(&self) -> Vec<u8> {
        let frames = self.index.len() as u32;
        let Resolution { width, height } = self.resolution;
        let idx_len = 8 + frames * 16;
        // RIFF size counts everything after the size field itself
        let riff_len = HEADER_LEN - 8 + self.movi_len - 4 + idx_len;
        let micros_per_frame = 1_000_000 / self.fps.max(1);
        let max_bytes_per_sec = self.largest_chunk.saturating_mul(self.fps);
        let image_size = width.saturating_mul(height).saturating_mul(3);

        let mut h = Vec::with_capacity(HEADER_LEN as usize);
        let mut put = |bytes: &[u8]| h.extend_from_slice(bytes);

        put(b"RIFF");
        put(&riff_len.to_le_bytes());
        put(b"AVI ");

        put(b"LIST");
        put(&192u32.to_le_bytes());
        put(b"hdrl");

        put(b"avih");
        put(&56u32.to_le_bytes());
        for value in [
            micros_per_frame,
            max_bytes_per_sec,
            0,
            AVIF_HASINDEX,
            frames,
            0,
            1,
            self.largest_chunk,
            width,
            height,
            0,
            0,
            0,
            0,
        ] {
            put(&value.to_le_bytes());
        }

        put(b"LIST");
        put(&116u32.to_le_bytes());
        put(b"strl");

        put(b"strh");
        put(&56u32.to_le_bytes());
        put(b"vids");
        put(b"MJPG");
        put(&0u32.to_le_bytes()); // flags
        put(&0u16.to_le_bytes()); // priority
        put(&0u16.to_le_bytes()); // language
        for value in [0, 1, self.fps, 0, frames, self.largest_chunk, u32::MAX, 0] {
            put(&value.to_le_bytes());
        }
        // create() keeps both dimensions within MAX_DIMENSION
        let rect = |v: u32| v.min(MAX_DIMENSION) as u16;
        for value in [0u16, 0, rect(width), rect(height)] {
            put(&value.to_le_bytes());
        }

        put(b"strf");
        put(&40u32.to_le_bytes());
        put(&40u32.to_le_bytes());
        put(&width.to_le_bytes());
        put(&height.to_le_bytes());
        put(&1u16.to_le_bytes());
        put(&24u16.to_le_bytes());
        put(b"MJPG");
        for value in [image_size, 0, 0, 0, 0] {
            put(&value.to_le_bytes());
        }

        put(b"LIST");
        put(&self.movi_len.to_le_bytes());
        put(b"movi");

        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb([value, value, value]))
    }

    #[test]
    fn test_header_layout() {
        let temp_dir = TempDir::new().expect("Test operation should succeed");
        let path = temp_dir.path().join("empty.avi");
        let writer = AviWriter::create(&path, Resolution::new(64, 48), 25, 80)
            .expect("Test operation should succeed");
        let header = writer.header();
        assert_eq!(header.len(), HEADER_LEN as usize);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"AVI ");
        assert_eq!(&header[24..28], b"avih");
        assert_eq!(&header[100..104], b"strh");
        assert_eq!(&header[164..168], b"strf");
        assert_eq!(&header[212..216], b"LIST");
        assert_eq!(&header[MOVI_FOURCC_OFFSET as usize..224], b"movi");
        assert_eq!(u32_at(&header, 32), 40_000);
    }

    #[test]
    fn test_finished_file_is_consistent() {
        let temp_dir = TempDir::new().expect("Test operation should succeed");
        let path = temp_dir.path().join("clip.avi");
        let mut writer = AviWriter::create(&path, Resolution::new(32, 24), 10, 75)
            .expect("Test operation should succeed");

        writer
            .write_frame(&solid(32, 24, 10))
            .expect("Test operation should succeed");
        writer
            .write_frame(&solid(64, 48, 200))
            .expect("Test operation should succeed");
        assert_eq!(writer.frames_written(), 2);
        let written = writer.finish().expect("Test operation should succeed");

        let bytes = std::fs::read(&written).expect("Test operation should succeed");
        assert_eq!(u32_at(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(u32_at(&bytes, 48), 2, "avih total frames");
        assert_eq!(u32_at(&bytes, 140), 2, "strh length");
        assert_eq!(u32_at(&bytes, 64), 32, "avih width");
        assert_eq!(u32_at(&bytes, 68), 24, "avih height");

        let movi_len = u32_at(&bytes, 216) as usize;
        let idx_at = MOVI_FOURCC_OFFSET as usize + movi_len;
        assert_eq!(&bytes[idx_at..idx_at + 4], b"idx1");
        assert_eq!(u32_at(&bytes, idx_at + 4), 32);

        // first chunk is a JPEG frame at the sink resolution
        assert_eq!(&bytes[224..228], b"00dc");
        let size = u32_at(&bytes, 228) as usize;
        let frame = image::load_from_memory(&bytes[232..232 + size])
            .expect("Test operation should succeed");
        assert_eq!((frame.width(), frame.height()), (32, 24));

        // second frame was scaled down to the sink resolution
        let second_offset = u32_at(&bytes, idx_at + 8 + 16 + 8) as usize;
        let second_size = u32_at(&bytes, idx_at + 8 + 16 + 12) as usize;
        let start = MOVI_FOURCC_OFFSET as usize + second_offset + 8;
        let frame = image::load_from_memory(&bytes[start..start + second_size])
            .expect("Test operation should succeed");
        assert_eq!((frame.width(), frame.height()), (32, 24));
    }

    #[test]
    fn test_create_in_missing_directory_fails() {
        let result = AviWriter::create(
            Path::new("/no/such/dir/out.avi"),
            Resolution::new(8, 8),
            30,
            80,
        );
        assert!(matches!(result, Err(OurError::WriteFailure(_))));
    }

    #[test]
    fn test_create_rejects_other_containers() {
        let temp_dir = TempDir::new().expect("Test operation should succeed");
        for name in ["out.mp4", "out", "out.avi.tmp"] {
            let path = temp_dir.path().join(name);
            let result = AviWriter::create(&path, Resolution::new(8, 8), 30, 80);
            assert!(matches!(result, Err(OurError::WriteFailure(_))), "{name}");
            assert!(!path.exists(), "{name}");
        }

        let upper = temp_dir.path().join("OUT.AVI");
        assert!(AviWriter::create(&upper, Resolution::new(8, 8), 30, 80).is_ok());
    }

    #[test]
    fn test_create_rejects_oversized_frames() {
        let temp_dir = TempDir::new().expect("Test operation should succeed");
        let path = temp_dir.path().join("wide.avi");
        let result = AviWriter::create(&path, Resolution::new(70_000, 8), 30, 80);
        assert!(matches!(result, Err(OurError::InvalidConfiguration(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_repeat_last_holds_frame() {
        let temp_dir = TempDir::new().expect("Test operation should succeed");
        let path = temp_dir.path().join("held.avi");
        let mut writer = AviWriter::create(&path, Resolution::new(16, 16), 10, 75)
            .expect("Test operation should succeed");

        writer
            .repeat_last(3)
            .expect("Test operation should succeed");
        assert_eq!(writer.frames_written(), 0);

        writer
            .write_frame(&solid(16, 16, 40))
            .expect("Test operation should succeed");
        writer
            .repeat_last(3)
            .expect("Test operation should succeed");
        assert_eq!(writer.frames_written(), 4);

        writer.finish().expect("Test operation should succeed");
        let bytes = std::fs::read(&path).expect("Test operation should succeed");
        assert_eq!(u32_at(&bytes, 48), 4);
        assert_eq!(u32_at(&bytes, 4) as usize, bytes.len() - 8);
    }
}
