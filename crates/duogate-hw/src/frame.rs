//! Frame type, regions of interest and YUYV conversion.

use std::time::Instant;

/// A captured grayscale camera frame. Never mutated after capture except by
/// the overlay pass on the acquisition loop's own copy.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Copy the pixels inside `roi` into a new frame.
    ///
    /// The region is clamped to the frame; an empty intersection yields a
    /// 0x0 frame.
    pub fn crop(&self, roi: &Roi) -> Frame {
        let roi = roi.clamp_to(self.width, self.height);
        let w = self.width as usize;
        let mut data = Vec::with_capacity(roi.width as usize * roi.height as usize);

        for y in roi.y..roi.y + roi.height {
            let start = y as usize * w + roi.x as usize;
            let end = start + roi.width as usize;
            match self.data.get(start..end) {
                Some(row) => data.extend_from_slice(row),
                None => break,
            }
        }

        let rows = if roi.width == 0 {
            0
        } else {
            (data.len() / roi.width as usize) as u32
        };

        Frame {
            data,
            width: roi.width,
            height: rows,
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// The lower-left quadrant of a `width` x `height` frame, where the badge
    /// is held up to the camera.
    pub fn lower_left_quadrant(width: u32, height: u32) -> Self {
        let half_h = height / 2;
        Self {
            x: 0,
            y: height - half_h,
            width: width / 2,
            height: half_h,
        }
    }

    /// Intersect with a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Self {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
