//! Zarr v2 array reader (C order, raw/gzip/zlib compressors).
//!
//! Displacement fields are stored as [x, y, z] or [x, y, z, c] arrays; the
//! trailing axis holds the per-voxel channels (dx, dy).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::ZlibDecoder;
use serde::Deserialize;

use super::{ChunkData, ChunkLayout, ChunkedVolume, VolumeDomain};
use crate::models::{Dtype, ScalarValues};

#[derive(Debug, Deserialize)]
struct Zarray {
    zarr_format: u32,
    shape: Vec<u64>,
    chunks: Vec<u64>,
    dtype: String,
    order: String,
    compressor: Option<Compressor>,
    fill_value: Option<serde_json::Value>,
    dimension_separator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Compressor {
    id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Raw,
    Gzip,
    Zlib,
}

/// A zarr v2 array on local disk.
pub struct ZarrVolume {
    root: PathBuf,
    dtype: Dtype,
    shape: [u64; 3],
    chunk_size: [u64; 3],
    channels: usize,
    ndim: usize,
    codec: Codec,
    fill_value: Option<f64>,
    separator: char,
}

impl ZarrVolume {
    /// Open the array at `root`. `nested` selects `/`-separated chunk keys
    /// when the metadata does not carry a dimension_separator.
    pub fn open(root: &Path, nested: bool) -> Result<Self> {
        let meta_path = root.join(".zarray");
        let content = fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let meta: Zarray = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", meta_path.display()))?;

        if meta.zarr_format != 2 {
            bail!("Unsupported zarr format {}", meta.zarr_format);
        }
        if meta.order != "C" {
            bail!("Unsupported array order '{}'", meta.order);
        }
        if meta.shape.len() != meta.chunks.len() {
            bail!("shape and chunks rank mismatch in {}", meta_path.display());
        }
        let ndim = meta.shape.len();
        if ndim != 3 && ndim != 4 {
            bail!("Expected a 3- or 4-dimensional array, got rank {}", ndim);
        }

        let (channels, chunk_channels) = if ndim == 4 {
            (meta.shape[3] as usize, meta.chunks[3] as usize)
        } else {
            (1, 1)
        };
        if chunk_channels != channels {
            bail!("Channel axis must not be chunked (chunks[3] != shape[3])");
        }

        let codec = match meta.compressor.as_ref().map(|c| c.id.as_str()) {
            None => Codec::Raw,
            Some("gzip") => Codec::Gzip,
            Some("zlib") => Codec::Zlib,
            Some(other) => bail!("Unsupported compressor '{}'", other),
        };

        let fill_value = meta.fill_value.as_ref().and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) if s == "NaN" => Some(f64::NAN),
            _ => None,
        });

        let separator = match meta.dimension_separator.as_deref() {
            Some("/") => '/',
            Some(_) => '.',
            None if nested => '/',
            None => '.',
        };

        Ok(Self {
            root: root.to_path_buf(),
            dtype: Dtype::from_typestr(&meta.dtype)?,
            shape: [meta.shape[0], meta.shape[1], meta.shape[2]],
            chunk_size: [meta.chunks[0], meta.chunks[1], meta.chunks[2]],
            channels,
            ndim,
            codec,
            fill_value,
            separator,
        })
    }

    fn chunk_path(&self, chunk: [u64; 3]) -> PathBuf {
        let mut parts = vec![
            chunk[0].to_string(),
            chunk[1].to_string(),
            chunk[2].to_string(),
        ];
        if self.ndim == 4 {
            parts.push("0".to_string());
        }
        self.root.join(parts.join(&self.separator.to_string()))
    }
}

impl ChunkedVolume for ZarrVolume {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn domain(&self) -> VolumeDomain {
        VolumeDomain {
            offset: [0, 0, 0],
            shape: self.shape,
        }
    }

    fn chunk_shape(&self) -> [u64; 3] {
        self.chunk_size
    }

    fn read_chunk(&self, chunk: [u64; 3]) -> Result<Option<ChunkData>> {
        let path = self.chunk_path(chunk);
        let Some(raw) = super::read_chunk_file(&path)? else {
            return Ok(None);
        };

        let bytes = match self.codec {
            // read_chunk_file already sniffs the gzip magic
            Codec::Raw | Codec::Gzip => raw,
            Codec::Zlib => {
                let mut decoded = Vec::new();
                ZlibDecoder::new(raw.as_slice())
                    .read_to_end(&mut decoded)
                    .with_context(|| format!("Failed to inflate chunk {}", path.display()))?;
                decoded
            }
        };

        // Zarr chunks are always full-size; edges are padded with fill_value
        let dims = [
            self.chunk_size[0] as usize,
            self.chunk_size[1] as usize,
            self.chunk_size[2] as usize,
        ];
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
            layout: ChunkLayout::CFastest,
            values: ScalarValues::from_le_bytes(self.dtype, &bytes)?,
        }))
    }

    fn missing_value(&self) -> Option<f64> {
        self.fill_value
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// 4x4x2 float32 displacement field with 2 channels and 2x2x2 chunks.
    /// Channel 0 holds 100*x + y, channel 1 holds -(100*x + y).
    pub(crate) fn write_fixture(root: &Path, gzip: bool) {
        let meta = serde_json::json!({
            "zarr_format": 2,
            "shape": [4, 4, 2, 2],
            "chunks": [2, 2, 2, 2],
            "dtype": "<f4",
            "order": "C",
            "compressor": if gzip {
                serde_json::json!({"id": "gzip", "level": 5})
            } else {
                serde_json::Value::Null
            },
            "fill_value": 0.0,
            "filters": null
        });
        fs::create_dir_all(root).unwrap();
        fs::write(root.join(".zarray"), meta.to_string()).unwrap();

        for cx in 0..2u64 {
            for cy in 0..2u64 {
                let mut bytes = Vec::new();
                // C order: channel fastest
                for x in 0..2u64 {
                    for y in 0..2u64 {
                        for _z in 0..2u64 {
                            let v = (100 * (cx * 2 + x) + (cy * 2 + y)) as f32;
                            bytes.write_all(&v.to_le_bytes()).unwrap();
                            bytes.write_all(&(-v).to_le_bytes()).unwrap();
                        }
                    }
                }
                let encoded = if gzip {
                    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                    enc.write_all(&bytes).unwrap();
                    enc.finish().unwrap()
                } else {
                    bytes
                };
                fs::write(root.join(format!("{}.{}.0.0", cx, cy)), encoded).unwrap();
            }
        }
    }

    /// Same array as `write_fixture` but with `/`-separated chunk keys
    /// (`cx/cy/0/0`). `declare` writes the separator into the metadata;
    /// without it the caller must open with `nested = true`.
    pub(crate) fn write_nested_fixture(root: &Path, declare: bool) {
        let mut meta = serde_json::json!({
            "zarr_format": 2,
            "shape": [4, 4, 2, 2],
            "chunks": [2, 2, 2, 2],
            "dtype": "<f4",
            "order": "C",
            "compressor": null,
            "fill_value": 0.0,
            "filters": null
        });
        if declare {
            meta["dimension_separator"] = serde_json::json!("/");
        }
        fs::create_dir_all(root).unwrap();
        fs::write(root.join(".zarray"), meta.to_string()).unwrap();

        for cx in 0..2u64 {
            for cy in 0..2u64 {
                let mut bytes = Vec::new();
                for x in 0..2u64 {
                    for y in 0..2u64 {
                        for _z in 0..2u64 {
                            let v = (100 * (cx * 2 + x) + (cy * 2 + y)) as f32;
                            bytes.write_all(&v.to_le_bytes()).unwrap();
                            bytes.write_all(&(-v).to_le_bytes()).unwrap();
                        }
                    }
                }
                let dir = root.join(cx.to_string()).join(cy.to_string()).join("0");
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("0"), bytes).unwrap();
            }
        }
    }

    #[test]
    fn test_open_and_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), false);

        let volume = ZarrVolume::open(dir.path(), false).unwrap();
        assert_eq!(volume.dtype(), Dtype::F32);
        assert_eq!(volume.channels(), 2);
        assert_eq!(volume.domain().shape, [4, 4, 2]);

        let chunk = volume.read_chunk([1, 1, 0]).unwrap().unwrap();
        // global voxel (3, 2, 1) -> local (1, 0, 1)
        assert_eq!(chunk.values.f64_at(chunk.index(1, 0, 1, 0)), 302.0);
        assert_eq!(chunk.values.f64_at(chunk.index(1, 0, 1, 1)), -302.0);
    }

    #[test]
    fn test_gzipped_chunks() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), true);

        let volume = ZarrVolume::open(dir.path(), false).unwrap();
        let chunk = volume.read_chunk([0, 0, 0]).unwrap().unwrap();
        assert_eq!(chunk.values.f64_at(chunk.index(1, 1, 0, 0)), 101.0);
    }

    #[test]
    fn test_nested_chunk_layout() {
        let dir = tempfile::tempdir().unwrap();
        write_nested_fixture(dir.path(), false);

        let volume = ZarrVolume::open(dir.path(), true).unwrap();
        let chunk = volume.read_chunk([1, 1, 0]).unwrap().unwrap();
        assert_eq!(chunk.values.f64_at(chunk.index(1, 0, 1, 0)), 302.0);
        assert_eq!(chunk.values.f64_at(chunk.index(1, 0, 1, 1)), -302.0);
    }

    #[test]
    fn test_declared_separator_overrides_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_nested_fixture(dir.path(), true);

        // dimension_separator in the metadata wins over the config kind
        let volume = ZarrVolume::open(dir.path(), false).unwrap();
        let chunk = volume.read_chunk([0, 1, 0]).unwrap().unwrap();
        assert_eq!(chunk.values.f64_at(chunk.index(0, 0, 0, 0)), 2.0);
    }

    #[test]
    fn test_missing_chunk_uses_fill() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), false);
        fs::remove_file(dir.path().join("0.0.0.0")).unwrap();

        let volume = ZarrVolume::open(dir.path(), false).unwrap();
        assert!(volume.read_chunk([0, 0, 0]).unwrap().is_none());
        assert_eq!(volume.missing_value(), Some(0.0));
    }
}
