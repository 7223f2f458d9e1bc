//! Point sampling over chunked volumes.
//!
//! Points are floor-divided into the scale's voxel grid, grouped by read
//! block (chunk extent times the configured multiplier) and fetched in
//! parallel. Out-of-bounds and non-finite points yield the dtype's error
//! value and never touch disk.

use anyhow::Result;
use hashbrown::HashMap;
use rayon::prelude::*;

use super::ChunkedVolume;
use crate::models::{ScalarField, ScalarValues};

/// Tuning knobs for a sampling run.
#[derive(Debug, Clone, Copy)]
pub struct SampleOptions {
    /// Chunks per read block along each axis.
    pub chunk_multiplier: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            chunk_multiplier: 1,
        }
    }
}

/// Sample `width` values per point. Input points are full-resolution pixel
/// coordinates; `downsample` converts them into this scale's voxel grid.
pub fn sample_points(
    volume: &dyn ChunkedVolume,
    points: &[[f64; 3]],
    downsample: [f64; 3],
    pool: &rayon::ThreadPool,
    opts: SampleOptions,
) -> Result<ScalarField> {
    let width = volume.channels();
    let dtype = volume.dtype();
    let domain = volume.domain();
    let chunk_shape = volume.chunk_shape();
    let multiplier = opts.chunk_multiplier.max(1);

    let mut out = ScalarValues::error_filled(dtype, points.len() * width);

    // Bin valid points by read block
    let mut blocks: HashMap<[u64; 3], Vec<(usize, [i64; 3])>> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        if !p.iter().all(|v| v.is_finite()) {
            continue;
        }
        let voxel = [
            (p[0] / downsample[0]).floor() as i64,
            (p[1] / downsample[1]).floor() as i64,
            (p[2] / downsample[2]).floor() as i64,
        ];
        if !domain.contains(voxel) {
            continue;
        }
        let mut block = [0u64; 3];
        for a in 0..3 {
            block[a] = (voxel[a] - domain.offset[a]) as u64 / (chunk_shape[a] * multiplier);
        }
        blocks.entry(block).or_default().push((i, voxel));
    }

    if blocks.is_empty() {
        return Ok(ScalarField::new(out, width));
    }

    let blocks: Vec<([u64; 3], Vec<(usize, [i64; 3])>)> = blocks.into_iter().collect();
    let gathered: Vec<BlockResult> = pool.install(|| {
        blocks
            .into_par_iter()
            .map(|(_, members)| sample_block(volume, members))
            .collect::<Result<Vec<_>>>()
    })?;

    for block in gathered {
        for (j, &point_idx) in block.point_indices.iter().enumerate() {
            for c in 0..width {
                out.copy_value(point_idx * width + c, &block.values, j * width + c);
            }
        }
    }

    Ok(ScalarField::new(out, width))
}

struct BlockResult {
    point_indices: Vec<usize>,
    /// width values per entry of point_indices, row-major
    values: ScalarValues,
}

fn sample_block(
    volume: &dyn ChunkedVolume,
    members: Vec<(usize, [i64; 3])>,
) -> Result<BlockResult> {
    let width = volume.channels();
    let dtype = volume.dtype();
    let domain = volume.domain();
    let chunk_shape = volume.chunk_shape();

    let mut point_indices = Vec::with_capacity(members.len());
    let mut values = ScalarValues::error_filled(dtype, members.len() * width);

    // A block may span several chunks; read each one once
    let mut by_chunk: HashMap<[u64; 3], Vec<(usize, [i64; 3])>> = HashMap::new();
    for (slot, (point_idx, voxel)) in members.into_iter().enumerate() {
        point_indices.push(point_idx);
        let mut chunk = [0u64; 3];
        for a in 0..3 {
            chunk[a] = (voxel[a] - domain.offset[a]) as u64 / chunk_shape[a];
        }
        by_chunk.entry(chunk).or_default().push((slot, voxel));
    }

    let missing = volume
        .missing_value()
        .map(|fill| ScalarValues::filled(dtype, 1, fill));

    for (chunk_idx, samples) in by_chunk {
        match volume.read_chunk(chunk_idx)? {
            Some(chunk) => {
                for (slot, voxel) in samples {
                    let local = local_coords(voxel, chunk_idx, chunk_shape, domain.offset);
                    for c in 0..width {
                        let src = chunk.index(local[0], local[1], local[2], c);
                        values.copy_value(slot * width + c, &chunk.values, src);
                    }
                }
            }
            None => {
                if let Some(fill) = &missing {
                    for (slot, _) in samples {
                        for c in 0..width {
                            values.copy_value(slot * width + c, fill, 0);
                        }
                    }
                }
                // Without a fill value the pre-filled error value stands
            }
        }
    }

    Ok(BlockResult {
        point_indices,
        values,
    })
}

fn local_coords(
    voxel: [i64; 3],
    chunk: [u64; 3],
    chunk_shape: [u64; 3],
    offset: [i64; 3],
) -> [usize; 3] {
    let mut local = [0usize; 3];
    for a in 0..3 {
        local[a] = ((voxel[a] - offset[a]) as u64 - chunk[a] * chunk_shape[a]) as usize;
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::precomputed::PrecomputedVolume;
    use crate::volume::zarr::ZarrVolume;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    #[test]
    fn test_sample_segmentation() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::precomputed::tests::write_fixture(dir.path());
        let volume = PrecomputedVolume::open(dir.path(), 0).unwrap();

        // Full-resolution pixels at 2x downsample
        let points = [[0.0, 0.0, 0.0], [6.0, 2.0, 2.0], [7.9, 7.9, 3.9]];
        let field = sample_points(
            &volume,
            &points,
            [2.0, 2.0, 2.0],
            &pool(),
            SampleOptions::default(),
        )
        .unwrap();

        assert_eq!(field.num_points(), 3);
        assert_eq!(field.f64(0, 0), 0.0);
        assert_eq!(field.f64(1, 0), 3.0 + 10.0 + 100.0);
        assert_eq!(field.f64(2, 0), 3.0 + 30.0 + 100.0);
    }

    #[test]
    fn test_out_of_bounds_and_nonfinite() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::precomputed::tests::write_fixture(dir.path());
        let volume = PrecomputedVolume::open(dir.path(), 0).unwrap();

        let points = [
            [-1.0, 0.0, 0.0],
            [0.0, 0.0, 100.0],
            [f64::NAN, 0.0, 0.0],
            [1.0, 1.0, 1.0],
        ];
        let field = sample_points(
            &volume,
            &points,
            [1.0, 1.0, 1.0],
            &pool(),
            SampleOptions::default(),
        )
        .unwrap();

        // Integer volumes report 0 for bad points
        assert_eq!(field.f64(0, 0), 0.0);
        assert_eq!(field.f64(1, 0), 0.0);
        assert_eq!(field.f64(2, 0), 0.0);
        assert_eq!(field.f64(3, 0), 111.0);
    }

    #[test]
    fn test_all_points_invalid() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::precomputed::tests::write_fixture(dir.path());
        let volume = PrecomputedVolume::open(dir.path(), 0).unwrap();

        let points = [[-5.0, -5.0, -5.0]];
        let field = sample_points(
            &volume,
            &points,
            [1.0, 1.0, 1.0],
            &pool(),
            SampleOptions::default(),
        )
        .unwrap();
        assert_eq!(field.num_points(), 1);
        assert_eq!(field.f64(0, 0), 0.0);
    }

    #[test]
    fn test_sample_displacement_field() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::zarr::tests::write_fixture(dir.path(), false);
        let volume = ZarrVolume::open(dir.path(), false).unwrap();

        let points = [[3.0, 2.0, 1.0], [0.0, 0.0, 0.0]];
        let field = sample_points(
            &volume,
            &points,
            [1.0, 1.0, 1.0],
            &pool(),
            SampleOptions::default(),
        )
        .unwrap();

        assert_eq!(field.width, 2);
        assert_eq!(field.f64(0, 0), 302.0);
        assert_eq!(field.f64(0, 1), -302.0);
        assert_eq!(field.f64(1, 0), 0.0);
    }

    #[test]
    fn test_chunk_multiplier_grouping() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::precomputed::tests::write_fixture(dir.path());
        let volume = PrecomputedVolume::open(dir.path(), 0).unwrap();

        let points: Vec<[f64; 3]> = (0..4)
            .flat_map(|x| (0..4).map(move |y| [x as f64, y as f64, 1.0]))
            .collect();
        let field = sample_points(
            &volume,
            &points,
            [1.0, 1.0, 1.0],
            &pool(),
            SampleOptions {
                chunk_multiplier: 4,
            },
        )
        .unwrap();

        for (i, p) in points.iter().enumerate() {
            assert_eq!(field.f64(i, 0), p[0] + 10.0 * p[1] + 100.0);
        }
    }
}
