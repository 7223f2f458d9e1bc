//! Datasource catalog: opens configured volumes on demand and caches the
//! handles per (dataset, scale).

use std::fmt;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use hashbrown::HashMap;
use tracing::info;

use super::{ChunkedVolume, PrecomputedVolume, ZarrVolume};
use crate::config::{Config, Datasource, VolumeKind};
use crate::error::ServiceError;

/// An opened volume plus the factor converting full-resolution pixel
/// coordinates into its voxel grid.
pub struct VolumeHandle {
    pub volume: Box<dyn ChunkedVolume>,
    pub downsample: [f64; 3],
}

impl fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeHandle")
            .field("dtype", &self.volume.dtype())
            .field("channels", &self.volume.channels())
            .field("downsample", &self.downsample)
            .finish()
    }
}

pub struct VolumeCatalog {
    config: Config,
    handles: RwLock<HashMap<(String, u32), Arc<VolumeHandle>>>,
    pool: rayon::ThreadPool,
}

impl VolumeCatalog {
    pub fn new(config: Config) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.limits.max_workers)
            .thread_name(|i| format!("chunk-fetch-{}", i))
            .build()
            .context("Failed to build chunk fetch pool")?;

        Ok(Self {
            config,
            handles: RwLock::new(HashMap::new()),
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub fn datasource(&self, name: &str) -> Result<&Datasource, ServiceError> {
        self.config
            .datasources
            .get(name)
            .ok_or_else(|| ServiceError::UnknownDataset(name.to_string()))
    }

    /// Open (or fetch from cache) a datasource at the given scale.
    pub fn open(&self, name: &str, scale: u32) -> Result<Arc<VolumeHandle>, ServiceError> {
        let ds = self.datasource(name)?;
        if !ds.has_scale(scale) {
            return Err(ServiceError::ScaleUnavailable {
                dataset: name.to_string(),
                scale,
            });
        }

        let key = (name.to_string(), scale);
        {
            // Lock poisoning only happens if an open panicked; propagate
            let handles = self.handles.read().expect("volume cache poisoned");
            if let Some(handle) = handles.get(&key) {
                return Ok(Arc::clone(handle));
            }
        }

        let handle = Arc::new(open_volume(name, ds, scale)?);
        let mut handles = self.handles.write().expect("volume cache poisoned");
        Ok(Arc::clone(handles.entry(key).or_insert(handle)))
    }
}

fn open_volume(name: &str, ds: &Datasource, scale: u32) -> Result<VolumeHandle, ServiceError> {
    info!("Opening datasource '{}' at scale {}", name, scale);

    let handle = match ds.kind {
        VolumeKind::Precomputed => {
            let volume = PrecomputedVolume::open(&ds.path, scale as usize)
                .with_context(|| format!("Failed to open precomputed volume '{}'", name))?;
            let resolution = volume.resolution();
            let mut downsample = [1.0; 3];
            for i in 0..3 {
                downsample[i] = resolution[i] / ds.voxel_size[i];
            }
            VolumeHandle {
                volume: Box::new(volume),
                downsample,
            }
        }
        VolumeKind::Zarr | VolumeKind::ZarrNested => {
            let volume = ZarrVolume::open(&ds.path, ds.kind == VolumeKind::ZarrNested)
                .with_context(|| format!("Failed to open zarr volume '{}'", name))?;
            // Displacement fields are downsampled in x/y only
            let factor = f64::from(1u32 << scale);
            VolumeHandle {
                volume: Box::new(volume),
                downsample: [factor, factor, 1.0],
            }
        }
    };

    check_declared_layout(name, ds, &handle)?;
    Ok(handle)
}

/// The config declares dtype and width for the /info/ endpoint; refuse to
/// serve data that contradicts it.
fn check_declared_layout(name: &str, ds: &Datasource, handle: &VolumeHandle) -> Result<()> {
    if handle.volume.dtype() != ds.dtype {
        bail!(
            "Datasource '{}' declares dtype {:?} but the volume stores {:?}",
            name,
            ds.dtype,
            handle.volume.dtype()
        );
    }
    if handle.volume.channels() != ds.width {
        bail!(
            "Datasource '{}' declares width {} but the volume stores {}",
            name,
            ds.width,
            handle.volume.channels()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Limits;
    use std::path::Path;

    fn catalog_for(dir: &Path) -> VolumeCatalog {
        crate::volume::zarr::tests::write_fixture(&dir.join("field.zarr"), false);

        let toml_str = format!(
            r#"
            [datasources.field]
            description = "test displacement field"
            kind = "zarr"
            scales = [0, 1]
            voxel_size = [4.0, 4.0, 40.0]
            services = ["transform"]
            dtype = "float32"
            width = 2
            path = "{}"
        "#,
            dir.join("field.zarr").display()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.limits.max_workers, Limits::default().max_workers);
        VolumeCatalog::new(config).unwrap()
    }

    #[test]
    fn test_open_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_for(dir.path());

        let first = catalog.open("field", 1).unwrap();
        assert_eq!(first.downsample, [2.0, 2.0, 1.0]);

        let second = catalog.open("field", 1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_dataset_and_scale() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_for(dir.path());

        let err = catalog.open("nope", 0).unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = catalog.open("field", 5).unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        crate::volume::zarr::tests::write_fixture(&dir.path().join("field.zarr"), false);

        let toml_str = format!(
            r#"
            [datasources.field]
            description = "wrong width"
            kind = "zarr"
            scales = [0]
            voxel_size = [4.0, 4.0, 40.0]
            services = ["transform"]
            dtype = "float32"
            width = 1
            path = "{}"
        "#,
            dir.path().join("field.zarr").display()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        let catalog = VolumeCatalog::new(config).unwrap();
        assert!(catalog.open("field", 0).is_err());
    }
}
