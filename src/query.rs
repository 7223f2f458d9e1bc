//! Point query and coordinate mapping over the volume catalog.

use crate::config::ServiceKind;
use crate::error::ServiceError;
use crate::models::{MappedPoint, ScalarField};
use crate::volume::sampler::{sample_points, SampleOptions};
use crate::volume::VolumeCatalog;

/// Displacements are stored fixed-point with two fractional bits, so stored
/// values are 4x the mip-0 displacement in pixels.
const FIXED_POINT_SCALE: f64 = 4.0;

fn check_location_limit(catalog: &VolumeCatalog, n: usize) -> Result<(), ServiceError> {
    let max = catalog.config().limits.max_locations;
    if n as u64 > max {
        return Err(ServiceError::TooManyLocations(max));
    }
    Ok(())
}

/// Look up the values stored at a set of full-resolution pixel coordinates.
/// Out-of-bounds points yield 0 for integer volumes and NaN for float ones.
pub fn query_points(
    catalog: &VolumeCatalog,
    dataset: &str,
    scale: u32,
    points: &[[f64; 3]],
) -> Result<ScalarField, ServiceError> {
    check_location_limit(catalog, points.len())?;
    let handle = catalog.open(dataset, scale)?;

    let opts = SampleOptions {
        chunk_multiplier: catalog.config().limits.chunk_multiplier,
    };
    let field = sample_points(
        handle.volume.as_ref(),
        points,
        handle.downsample,
        catalog.pool(),
        opts,
    )?;
    Ok(field)
}

/// Map points through a displacement field dataset. Channel 1 holds dx and
/// channel 0 holds dy; z passes through unchanged.
pub fn map_points(
    catalog: &VolumeCatalog,
    dataset: &str,
    scale: u32,
    points: &[[f64; 3]],
) -> Result<Vec<MappedPoint>, ServiceError> {
    let ds = catalog.datasource(dataset)?;
    if !ds.provides(ServiceKind::Transform) {
        return Err(ServiceError::NoTransformService);
    }

    let field = query_points(catalog, dataset, scale, points)?;
    if field.width < 2 {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "Transform dataset '{}' stores {} channel(s), expected at least 2",
            dataset,
            field.width
        )));
    }

    let mapped = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let dx = (field.f64(i, 1) / FIXED_POINT_SCALE) as f32;
            let dy = (field.f64(i, 0) / FIXED_POINT_SCALE) as f32;
            MappedPoint {
                x: p[0] as f32 + dx,
                y: p[1] as f32 + dy,
                z: p[2] as f32,
                dx,
                dy,
            }
        })
        .collect();

    Ok(mapped)
}
