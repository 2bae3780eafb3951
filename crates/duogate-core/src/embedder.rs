//! Face embedding collaborator.
//!
//! The matching model is opaque to the pipeline: anything that turns a frame
//! into a list of `(bounding box, vector)` pairs can sit behind
//! [`FaceEmbedder`]. [`CommandEmbedder`] drives an external helper process
//! (e.g. a DeepFace/SFace wrapper) over stdin/stdout.

use crate::types::{BoundingBox, FaceDetection};
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat};
use serde::Deserialize;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to start embedding helper {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("embedding helper i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding helper exited with {code:?}: {stderr}")]
    HelperFailed { code: Option<i32>, stderr: String },
    #[error("embedding helper output is not valid: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("embedding job was dropped before completing")]
    Cancelled,
}

/// Computes face embeddings for every face found in a grayscale frame.
pub trait FaceEmbedder: Send + Sync {
    fn embed(&self, gray: &[u8], width: u32, height: u32) -> Result<Vec<FaceDetection>, EmbedError>;
}

/// Default width frames are scaled to before embedding.
pub const DEFAULT_EMBED_WIDTH: u32 = 720;

/// Runs an external helper per frame.
///
/// The helper reads a PNG on stdin and prints a JSON array of
/// `{"facial_area": {"x", "y", "w", "h"}, "embedding": [..]}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandEmbedder {
    program: PathBuf,
    args: Vec<String>,
    scaled_width: u32,
}

impl CommandEmbedder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            scaled_width: DEFAULT_EMBED_WIDTH,
        }
    }

    pub fn with_scaled_width(mut self, width: u32) -> Self {
        self.scaled_width = width.max(1);
        self
    }
}

impl FaceEmbedder for CommandEmbedder {
    fn embed(&self, gray: &[u8], width: u32, height: u32) -> Result<Vec<FaceDetection>, EmbedError> {
        let (png, scale) = encode_scaled_png(gray, width, height, self.scaled_width)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EmbedError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // Feed stdin from a separate thread so a helper that starts writing
        // before it finishes reading cannot deadlock against us.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("helper stdin not captured"))?;
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child.wait_with_output()?;
        let write_result = writer
            .join()
            .map_err(|_| std::io::Error::other("stdin writer panicked"))?;

        if !output.status.success() {
            return Err(EmbedError::HelperFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        write_result?;

        let faces = parse_helper_output(&output.stdout, scale)?;
        tracing::debug!(faces = faces.len(), "embedding helper finished");
        Ok(faces)
    }
}

#[derive(Deserialize)]
struct HelperFace {
    facial_area: FacialArea,
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct FacialArea {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

/// Resize a grayscale frame to `target_width` (aspect preserved) and encode
/// it as PNG. Returns the PNG bytes and the applied scale factor.
fn encode_scaled_png(
    gray: &[u8],
    width: u32,
    height: u32,
    target_width: u32,
) -> Result<(Vec<u8>, f32), EmbedError> {
    let expected = width as usize * height as usize;
    if width == 0 || height == 0 || gray.len() < expected {
        return Err(EmbedError::InvalidFrame { width, height });
    }
    let img = GrayImage::from_raw(width, height, gray[..expected].to_vec())
        .ok_or(EmbedError::InvalidFrame { width, height })?;

    let scale = target_width as f32 / width as f32;
    let scaled_height = ((height as f32 * scale).round() as u32).max(1);
    let resized = if target_width == width {
        img
    } else {
        image::imageops::resize(&img, target_width, scaled_height, FilterType::Triangle)
    };

    let mut png = Vec::new();
    DynamicImage::ImageLuma8(resized).write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok((png, scale))
}

/// Parse helper JSON, mapping boxes from scaled back to frame coordinates.
fn parse_helper_output(stdout: &[u8], scale: f32) -> Result<Vec<FaceDetection>, EmbedError> {
    let faces: Vec<HelperFace> = serde_json::from_slice(stdout)?;
    let inv = if scale > 0.0 { 1.0 / scale } else { 1.0 };

    Ok(faces
        .into_iter()
        .map(|f| FaceDetection {
            bbox: BoundingBox {
                x: f.facial_area.x * inv,
                y: f.facial_area.y * inv,
                width: f.facial_area.w * inv,
                height: f.facial_area.h * inv,
            },
            vector: f.embedding,
        })
        .collect())
}
