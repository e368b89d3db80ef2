//! Reconstruction identity and per-reconstruction camera record

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Cursor};
use uuid::Uuid;

/// Alphabet without visually ambiguous characters (0/O, 1/I/l)
const ID_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Digits needed to encode 128 bits in base 57
const ID_LENGTH: usize = 22;

/// Opaque identifier scoping all state and jobs of one reconstruction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReconstructionId(String);

impl ReconstructionId {
    /// Generate a fresh short id from a random UUID
    pub fn generate() -> Self {
        let mut value = Uuid::new_v4().as_u128();
        let base = ID_ALPHABET.len() as u128;
        let mut encoded = Vec::with_capacity(ID_LENGTH);

        for _ in 0..ID_LENGTH {
            encoded.push(ID_ALPHABET[(value % base) as usize]);
            value /= base;
        }
        encoded.reverse();

        // Alphabet is ASCII
        Self(encoded.into_iter().map(char::from).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReconstructionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ReconstructionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ReconstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First image of a new reconstruction
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    /// Focal length in pixels; read from EXIF, then the configured default,
    /// when absent
    pub focal: Option<f64>,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, focal: None }
    }

    pub fn with_focal(mut self, focal: f64) -> Self {
        self.focal = Some(focal);
        self
    }
}

/// Focal length from the image's EXIF block, scaled by 1000.
///
/// `None` when there is no EXIF data, no `FocalLength` tag or a zero value.
pub fn exif_focal(bytes: &[u8]) -> Option<f64> {
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(Cursor::new(bytes)))
        .ok()?;
    let field = exif.get_field(exif::Tag::FocalLength, exif::In::PRIMARY)?;
    let millimetres = match &field.value {
        exif::Value::Rational(values) => values.first()?.to_f64(),
        other => other.get_uint(0).map(f64::from)?,
    };

    let focal = (millimetres * 1000.0).trunc();
    (focal.is_finite() && focal > 0.0).then_some(focal)
}

/// Pinhole camera parameters handed to the engine with every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    pub principal_x: f64,
    pub principal_y: f64,
    pub aspect_ratio: f64,
    pub skew: f64,
}

impl CameraSettings {
    /// Camera centred on the image, square pixels, no skew
    pub fn centered(width: u32, height: u32, focal: f64) -> Self {
        Self {
            width,
            height,
            focal,
            principal_x: f64::from(width) / 2.0,
            principal_y: f64::from(height) / 2.0,
            aspect_ratio: 1.0,
            skew: 0.0,
        }
    }

    /// Read the image header and build centred settings for it
    pub fn from_image_bytes(bytes: &[u8], focal: f64) -> Result<Self> {
        let (width, height) = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_dimensions()?;
        Ok(Self::centered(width, height, focal))
    }

    /// One value per line, terminated by a blank line
    pub fn to_engine_format(&self) -> String {
        format!(
            "{}\n{}\n{}\n{:?}\n{:?}\n{:?}\n{:?}\n\n",
            self.width,
            self.height,
            self.focal,
            self.principal_x,
            self.principal_y,
            self.aspect_ratio,
            self.skew
        )
    }
}
