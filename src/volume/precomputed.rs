//! Neuroglancer precomputed volume reader (raw encoding).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use super::{read_chunk_file, ChunkData, ChunkLayout, ChunkedVolume, VolumeDomain};
use crate::models::{Dtype, ScalarValues};

/// Root `info` JSON of a precomputed volume.
#[derive(Debug, Deserialize)]
struct Info {
    data_type: String,
    num_channels: usize,
    scales: Vec<ScaleInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScaleInfo {
    key: String,
    size: [u64; 3],
    resolution: [f64; 3],
    chunk_sizes: Vec<[u64; 3]>,
    #[serde(default)]
    voxel_offset: [i64; 3],
    encoding: String,
}

/// One scale of a precomputed volume on local disk.
pub struct PrecomputedVolume {
    root: PathBuf,
    dtype: Dtype,
    channels: usize,
    scale: ScaleInfo,
    chunk_size: [u64; 3],
}

impl PrecomputedVolume {
    /// Open the volume at `root`, selecting a scale by index into the info's
    /// scale list (mip level).
    pub fn open(root: &Path, scale_index: usize) -> Result<Self> {
        let info_path = root.join("info");
        let content = fs::read_to_string(&info_path)
            .with_context(|| format!("Failed to read {}", info_path.display()))?;
        let info: Info = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", info_path.display()))?;

        let dtype = parse_data_type(&info.data_type)?;

        let scale = info
            .scales
            .get(scale_index)
            .ok_or_else(|| {
                anyhow!(
                    "Scale index {} out of range; volume has {} scales",
                    scale_index,
                    info.scales.len()
                )
            })?
            .clone();

        if scale.encoding != "raw" {
            bail!("Unsupported chunk encoding '{}'", scale.encoding);
        }
        let chunk_size = *scale
            .chunk_sizes
            .first()
            .ok_or_else(|| anyhow!("Scale '{}' declares no chunk sizes", scale.key))?;

        Ok(Self {
            root: root.to_path_buf(),
            dtype,
            channels: info.num_channels,
            scale,
            chunk_size,
        })
    }

    /// Voxel resolution of the selected scale in nm.
    pub fn resolution(&self) -> [f64; 3] {
        self.scale.resolution
    }

    fn chunk_path(&self, chunk: [u64; 3]) -> (PathBuf, [usize; 3]) {
        let mut begin = [0i64; 3];
        let mut end = [0i64; 3];
        for i in 0..3 {
            begin[i] = self.scale.voxel_offset[i] + (chunk[i] * self.chunk_size[i]) as i64;
            end[i] = (begin[i] + self.chunk_size[i] as i64)
                .min(self.scale.voxel_offset[i] + self.scale.size[i] as i64)
                .max(begin[i]);
        }
        let name = format!(
            "{}-{}_{}-{}_{}-{}",
            begin[0], end[0], begin[1], end[1], begin[2], end[2]
        );
        let dims = [
            (end[0] - begin[0]) as usize,
            (end[1] - begin[1]) as usize,
            (end[2] - begin[2]) as usize,
        ];
        (self.root.join(&self.scale.key).join(name), dims)
    }
}

impl ChunkedVolume for PrecomputedVolume {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn domain(&self) -> VolumeDomain {
        VolumeDomain {
            offset: self.scale.voxel_offset,
            shape: self.scale.size,
        }
    }

    fn chunk_shape(&self) -> [u64; 3] {
        self.chunk_size
    }

    fn read_chunk(&self, chunk: [u64; 3]) -> Result<Option<ChunkData>> {
        let (path, dims) = self.chunk_path(chunk);
        let Some(bytes) = read_chunk_file(&path)? else {
            return Ok(None);
        };

        let expected = dims[0] * dims[1] * dims[2] * self.channels * self.dtype.size();
        if bytes.len() != expected {
            bail!(
                "Chunk {} has {} bytes, expected {}",
                path.display(),
                bytes.len(),
                expected
            );
        }

        Ok(Some(ChunkData {
            dims,
            channels: self.channels,
            layout: ChunkLayout::XFastest,
            values: ScalarValues::from_le_bytes(self.dtype, &bytes)?,
        }))
    }
}

fn parse_data_type(s: &str) -> Result<Dtype> {
    let dtype = match s {
        "uint8" => Dtype::U8,
        "uint16" => Dtype::U16,
        "uint32" => Dtype::U32,
        "uint64" => Dtype::U64,
        "int8" => Dtype::I8,
        "int16" => Dtype::I16,
        "int32" => Dtype::I32,
        "int64" => Dtype::I64,
        "float32" => Dtype::F32,
        "float64" => Dtype::F64,
        other => bail!("Unsupported data_type '{}'", other),
    };
    Ok(dtype)
}
