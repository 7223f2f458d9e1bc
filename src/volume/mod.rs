//! Chunked volume access: neuroglancer precomputed and zarr v2 layouts.

pub mod catalog;
pub mod precomputed;
pub mod sampler;
pub mod zarr;

pub use catalog::{VolumeCatalog, VolumeHandle};
pub use precomputed::PrecomputedVolume;
pub use sampler::sample_points;
pub use zarr::ZarrVolume;

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use crate::models::{Dtype, ScalarValues};

/// Voxel extent of one scale of a volume.
#[derive(Debug, Clone, Copy)]
pub struct VolumeDomain {
    /// Lower corner of the voxel grid (precomputed voxel_offset).
    pub offset: [i64; 3],
    /// Size in voxels along x, y, z.
    pub shape: [u64; 3],
}

impl VolumeDomain {
    pub fn contains(&self, voxel: [i64; 3]) -> bool {
        (0..3).all(|i| {
            voxel[i] >= self.offset[i] && voxel[i] < self.offset[i] + self.shape[i] as i64
        })
    }
}

/// Memory layout of a decoded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLayout {
    /// Precomputed raw encoding: x fastest, then y, z, channel.
    XFastest,
    /// Zarr C order on an [x, y, z, c] array: channel fastest, then z, y, x.
    CFastest,
}

/// One decoded chunk with its actual dimensions.
#[derive(Debug, Clone)]
pub struct ChunkData {
    pub dims: [usize; 3],
    pub channels: usize,
    pub layout: ChunkLayout,
    pub values: ScalarValues,
}

impl ChunkData {
    /// Flat index of (x, y, z, c) relative to the chunk origin.
    pub fn index(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        let [dx, dy, dz] = self.dims;
        match self.layout {
            ChunkLayout::XFastest => ((c * dz + z) * dy + y) * dx + x,
            ChunkLayout::CFastest => ((x * dy + y) * dz + z) * self.channels + c,
        }
    }
}

/// A volume readable chunk by chunk at one scale.
pub trait ChunkedVolume: Send + Sync {
    fn dtype(&self) -> Dtype;
    /// Values stored per voxel.
    fn channels(&self) -> usize;
    fn domain(&self) -> VolumeDomain;
    /// Nominal chunk size; edge chunks may be smaller (precomputed) or
    /// padded (zarr).
    fn chunk_shape(&self) -> [u64; 3];
    /// Read the chunk at the given grid index. Returns None when the chunk
    /// file does not exist.
    fn read_chunk(&self, chunk: [u64; 3]) -> Result<Option<ChunkData>>;
    /// Value to report for voxels inside the domain whose chunk file is
    /// absent. None means the dtype's error value.
    fn missing_value(&self) -> Option<f64> {
        None
    }
}

/// Read a chunk file, transparently gunzipping when the gzip magic is
/// present. Returns None when the file does not exist.
pub(crate) fn read_chunk_file(path: &Path) -> Result<Option<Vec<u8>>> {
    let raw = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read chunk {}", path.display()))
        }
    };

    if raw.len() >= 2 && raw[0] == 0x1f && raw[1] == 0x8b {
        let mut decoded = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut decoded)
            .with_context(|| format!("Failed to gunzip chunk {}", path.display()))?;
        Ok(Some(decoded))
    } else {
        Ok(Some(raw))
    }
}
