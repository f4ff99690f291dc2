//! Decoding of job inputs shared by the handlers.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use diffbox_core::types::JobParams;
use image::ImageFormat;
use serde::de::DeserializeOwned;

use crate::error::PipelineError;

/// Seed value that asks for a random seed.
const RANDOM_SEED: i64 = -1;

/// Deserialize job parameters into a handler's typed parameter struct.
pub fn decode_params<T: DeserializeOwned>(params: &JobParams) -> Result<T, PipelineError> {
    serde_json::from_value(serde_json::Value::Object(params.clone()))
        .map_err(|e| PipelineError::InvalidParams(e.to_string()))
}

/// Decode a base64 image (optionally a `data:` URL) and re-encode it as
/// PNG, whatever format it arrived in.
pub fn decode_image(encoded: &str) -> Result<Vec<u8>, PipelineError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| PipelineError::Image(format!("invalid base64: {e}")))?;

    let image = image::load_from_memory(&bytes).map_err(|e| PipelineError::Image(e.to_string()))?;
    tracing::debug!(width = image.width(), height = image.height(), "Decoded input image");

    let mut png = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| PipelineError::Image(e.to_string()))?;

    Ok(png.into_inner())
}

/// Turn a requested seed into the seed actually used.
///
/// A missing seed or `-1` draws a random 32-bit seed.
pub fn resolve_seed(requested: Option<i64>) -> Result<u64, PipelineError> {
    match requested {
        None | Some(RANDOM_SEED) => Ok(u64::from(rand::random::<u32>())),
        Some(seed) => u64::try_from(seed)
            .map_err(|_| PipelineError::InvalidParams(format!("seed must be -1 or non-negative, got {seed}"))),
    }
}

/// Render a job id as a file name stem that cannot escape its directory.
pub fn file_stem(job_id: &str) -> String {
    let stem: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "job".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A base64 encoded image of the given format.
    pub fn encoded_image(width: u32, height: u32, format: ImageFormat) -> String {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image).write_to(&mut out, format).unwrap();
        STANDARD.encode(out.into_inner())
    }
}
