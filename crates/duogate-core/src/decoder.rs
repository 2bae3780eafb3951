//! Badge decoding from a grayscale region of interest.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image buffer too short: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("decoder failed: {0}")]
    Failed(String),
}

/// Decodes zero or more badge codes from a grayscale image.
pub trait BarcodeDecoder: Send + Sync {
    fn decode(&self, gray: &[u8], width: u32, height: u32) -> Result<Vec<String>, DecodeError>;
}

/// The first usable code of a decode result. Surrounding whitespace is not
/// part of a badge id.
pub fn first_code(codes: &[String]) -> Option<&str> {
    codes.iter().map(|c| c.trim()).find(|c| !c.is_empty())
}

/// QR badge decoder backed by `rqrr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct QrDecoder;

impl BarcodeDecoder for QrDecoder {
    fn decode(&self, gray: &[u8], width: u32, height: u32) -> Result<Vec<String>, DecodeError> {
        let w = width as usize;
        let h = height as usize;
        let expected = w * h;
        if gray.len() < expected {
            return Err(DecodeError::InvalidLength {
                expected,
                actual: gray.len(),
            });
        }
        if expected == 0 {
            return Ok(Vec::new());
        }

        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(w, h, |x, y| gray[y * w + x]);
        let grids = prepared.detect_grids();

        let mut codes = Vec::with_capacity(grids.len());
        for grid in grids {
            match grid.decode() {
                Ok((_, content)) => codes.push(content),
                Err(e) => tracing::debug!(error = ?e, "QR grid found but not decodable"),
            }
        }
        Ok(codes)
    }
}
