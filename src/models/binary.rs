//! Raw binary point encoding used by the `values_binary` endpoints.
//!
//! Request bodies are little-endian float32 arrays holding N (x, y, z)
//! points, laid out either `3xN` (all x, then all y, then all z) or `Nx3`
//! (interleaved per point).

use serde::Deserialize;

use crate::error::ServiceError;

/// Array layout of a binary request/response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BinaryFormat {
    #[serde(rename = "array_float_3xN")]
    Array3xN,
    #[serde(rename = "array_float_Nx3")]
    ArrayNx3,
}

impl BinaryFormat {
    /// Channel-major output (`w x N`) mirrors the 3xN input layout.
    pub fn channel_major(&self) -> bool {
        matches!(self, BinaryFormat::Array3xN)
    }
}

/// Decode a binary body into points.
pub fn decode_points(body: &[u8], format: BinaryFormat) -> Result<Vec<[f64; 3]>, ServiceError> {
    if body.len() % 12 != 0 {
        return Err(ServiceError::BadRequest(format!(
            "Binary body length {} is not a multiple of 12 (3 x float32)",
            body.len()
        )));
    }
    let n = body.len() / 12;
    let floats: Vec<f32> = body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let points = match format {
        BinaryFormat::Array3xN => (0..n)
            .map(|i| [floats[i] as f64, floats[n + i] as f64, floats[2 * n + i] as f64])
            .collect(),
        BinaryFormat::ArrayNx3 => (0..n)
            .map(|i| {
                [
                    floats[3 * i] as f64,
                    floats[3 * i + 1] as f64,
                    floats[3 * i + 2] as f64,
                ]
            })
            .collect(),
    };
    Ok(points)
}

/// Encode (dx, dy) displacements as float32, `2xN` or `Nx2` to match the
/// requested layout.
pub fn encode_displacements(
    points: &[crate::models::MappedPoint],
    format: BinaryFormat,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * 8);
    match format {
        BinaryFormat::Array3xN => {
            for p in points {
                out.extend_from_slice(&p.dx.to_le_bytes());
            }
            for p in points {
                out.extend_from_slice(&p.dy.to_le_bytes());
            }
        }
        BinaryFormat::ArrayNx3 => {
            for p in points {
                out.extend_from_slice(&p.dx.to_le_bytes());
                out.extend_from_slice(&p.dy.to_le_bytes());
            }
        }
    }
    out
}
