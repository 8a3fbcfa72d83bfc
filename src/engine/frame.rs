//! Raw frames and frame sources
//!
//! A frame source yields captured frames one at a time. Frames are immutable
//! once captured and live for a single inference cycle.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Pixel layout of a raw frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
    Gray8,
    /// Semi-planar YUV 4:2:0 as produced by device capture pipelines
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats, `None` for planar ones.
    pub fn channels(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => Some(3),
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => Some(4),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Nv12 => None,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PixelFormat::Rgb8),
            1 => Some(PixelFormat::Bgr8),
            2 => Some(PixelFormat::Rgba8),
            3 => Some(PixelFormat::Bgra8),
            4 => Some(PixelFormat::Gray8),
            5 => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

/// Captured image buffer
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    /// Sequence number assigned by the source
    pub index: u64,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
            index: 0,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::new(width, height, PixelFormat::Rgb8, rgb.into_raw())
    }

    /// Check dimensions and buffer length against the declared layout.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Format(format!(
                "frame has zero dimension {}x{}",
                self.width, self.height
            )));
        }
        let channels = self.format.channels().ok_or_else(|| {
            Error::Format(format!("{:?} frames are not supported", self.format))
        })?;
        let expected = self.width as usize * self.height as usize * channels;
        if self.data.len() != expected {
            return Err(Error::Format(format!(
                "{:?} frame {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// RGB triple at `(x, y)`. Assumes a validated packed frame.
    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let channels = self.format.channels().unwrap_or(3);
        let i = (y as usize * self.width as usize + x as usize) * channels;
        let p = &self.data[i..i + channels];
        match self.format {
            PixelFormat::Rgb8 | PixelFormat::Rgba8 => [p[0], p[1], p[2]],
            PixelFormat::Bgr8 | PixelFormat::Bgra8 => [p[2], p[1], p[0]],
            PixelFormat::Gray8 => [p[0], p[0], p[0]],
            PixelFormat::Nv12 => [0, 0, 0],
        }
    }
}

/// Supplier of frames for the standalone loop
pub trait FrameSource {
    /// Next frame, `None` once exhausted. A decode failure is reported per frame.
    fn next_frame(&mut self) -> Option<Result<RawFrame>>;
}

/// Frames held in memory
pub struct MemorySource {
    frames: VecDeque<RawFrame>,
}

impl MemorySource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(i, f)| f.with_index(i as u64))
            .collect();
        Self { frames }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        self.frames.pop_front().map(Ok)
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Image files from a directory (sorted by name) or a single file
pub struct ImageSequenceSource {
    paths: VecDeque<PathBuf>,
    next_index: u64,
}

impl ImageSequenceSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let paths: Vec<PathBuf> = if path.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(path)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                        .unwrap_or(false)
                })
                .collect();
            entries.sort();
            entries
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(Error::Configuration(format!(
                "frame source {} does not exist",
                path.display()
            )));
        };

        info!("Frame source {} with {} images", path.display(), paths.len());

        Ok(Self {
            paths: paths.into(),
            next_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Option<Result<RawFrame>> {
        let path = self.paths.pop_front()?;
        let index = self.next_index;
        self.next_index += 1;
        debug!("Reading frame {} from {}", index, path.display());

        let frame = std::fs::read(&path)
            .map_err(Error::from)
            .and_then(|data| decode_image(&data))
            .map(|image| RawFrame::from_image(&image).with_index(index));
        Some(frame)
    }
}

/// Decode image bytes, applying the EXIF orientation tag
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)
        .map_err(|e| Error::Format(format!("cannot decode image: {}", e)))?;
    Ok(apply_exif_orientation(data, image))
}

/// Camera stills often carry an orientation tag instead of rotated pixels
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_validate_rejects_zero_size() {
        let frame = RawFrame::new(0, 10, PixelFormat::Rgb8, vec![]);
        assert!(matches!(frame.validate(), Err(Error::Format(_))));
    }

    #[test]
    fn test_validate_rejects_nv12() {
        let frame = RawFrame::new(4, 4, PixelFormat::Nv12, vec![0; 24]);
        assert!(matches!(frame.validate(), Err(Error::Format(_))));
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let frame = RawFrame::new(4, 4, PixelFormat::Rgba8, vec![0; 48]);
        assert!(matches!(frame.validate(), Err(Error::Format(_))));
    }

    #[test]
    fn test_bgr_pixel_is_swapped() {
        let frame = RawFrame::new(1, 1, PixelFormat::Bgr8, vec![1, 2, 3]);
        assert_eq!(frame.rgb_at(0, 0), [3, 2, 1]);
    }

    #[test]
    fn test_image_sequence_reads_sorted_images() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10u8)] {
            let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_pixel(3, 2, Rgb([value, value, value]));
            img.save(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height, first.index), (3, 2, 0));
        assert_eq!(first.rgb_at(0, 0), [10, 10, 10]);

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.index, 1);
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_undecodable_file_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg").unwrap();

        let mut source = ImageSequenceSource::open(&path).unwrap();
        assert!(matches!(source.next_frame(), Some(Err(Error::Format(_)))));
    }
}
