//! Service configuration: datasources, annotation datasets and limits.
//!
//! Datasources are declared in a TOML file passed on the command line.
//! SeaTable credentials come from the environment (`SEATABLE_SERVER`,
//! `SEATABLE_TOKEN`) so they never land in the config file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::Dtype;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub datasources: BTreeMap<String, Datasource>,
    #[serde(default)]
    pub annotations: BTreeMap<String, AnnotationDataset>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Limits {
    /// Max number of locations per request.
    pub max_locations: u64,
    /// Threads used for parallel chunk fetching.
    pub max_workers: usize,
    /// Each chunk dimension is multiplied by this when grouping reads,
    /// e.g. 4 will lead to 64 (4*4*4) chunks per read group.
    pub chunk_multiplier: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_locations: 10_000_000_000,
            max_workers: 16,
            chunk_multiplier: 1,
        }
    }
}

/// On-disk layout of a chunked volume.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[serde(alias = "neuroglancer_precomputed")]
    Precomputed,
    Zarr,
    #[serde(rename = "zarr-nested")]
    ZarrNested,
}

/// Which endpoints a datasource is exposed through.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Transform,
    Query,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Datasource {
    /// Human-readable description shown in /info/.
    pub description: String,
    pub kind: VolumeKind,
    /// Mip levels served. Query units stay in full-resolution pixels
    /// regardless of the scale chosen. For precomputed volumes the scale is
    /// used as an index into the info's scale list, so the info must list
    /// every mip from 0 up; volumes holding only a subset of mips are not
    /// supported.
    pub scales: Vec<u32>,
    /// Base resolution (mip 0) in nm.
    pub voxel_size: [f64; 3],
    pub services: Vec<ServiceKind>,
    pub dtype: Dtype,
    /// Values stored per point (e.g. 2 for dx,dy displacement fields).
    pub width: usize,
    /// Root directory of the volume on disk.
    pub path: PathBuf,
}

impl Datasource {
    pub fn provides(&self, service: ServiceKind) -> bool {
        self.services.contains(&service)
    }

    pub fn has_scale(&self, scale: u32) -> bool {
        self.scales.contains(&scale)
    }
}

/// One SeaTable table backing an annotation dataset.
#[derive(Debug, Deserialize, Clone)]
pub struct TableRef {
    /// Base (dtable) name, used for logging only; access goes through the
    /// base API token.
    pub base: String,
    pub table: String,
    /// Env var holding the base API token. Defaults to SEATABLE_TOKEN.
    pub token_env: Option<String>,
}

fn default_bad_status() -> Vec<String> {
    vec!["duplicate".to_string(), "bad_nucleus".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnnotationDataset {
    /// Tables are concatenated in order; the first one defines the columns.
    pub tables: Vec<TableRef>,
    /// Materialization version -> root ID column, e.g. "630" -> "root_630".
    pub versions: BTreeMap<String, String>,
    /// Rows with these status values are dropped.
    #[serde(default = "default_bad_status")]
    pub bad_status: Vec<String>,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }
}

/// SeaTable connection parameters taken from the environment.
#[derive(Debug, Clone)]
pub struct SeaTableAuth {
    pub server: String,
    pub default_token: String,
}

impl SeaTableAuth {
    pub fn from_env() -> Option<Self> {
        let server = std::env::var("SEATABLE_SERVER").ok()?;
        let default_token = std::env::var("SEATABLE_TOKEN").ok()?;
        Some(Self {
            server,
            default_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [limits]
            max_locations = 1000000
            max_workers = 8

            [datasources.test]
            description = "Test volume"
            kind = "zarr"
            scales = [7]
            voxel_size = [4.0, 4.0, 40.0]
            services = ["transform"]
            dtype = "float32"
            width = 2
            path = "test.zarr"

            [datasources.zheng_ca3_v2]
            description = "super voxel segmentation"
            kind = "neuroglancer_precomputed"
            scales = [1]
            voxel_size = [18.0, 18.0, 45.0]
            services = ["query"]
            dtype = "uint64"
            width = 1
            path = "segmentation/zheng_ca3"

            [annotations.flywire]
            tables = [
                { base = "main", table = "info" },
                { base = "optic_lobes", table = "optic" },
            ]
            versions = { "630" = "root_630", "783" = "root_783", live = "root_id" }
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.limits.max_locations, 1_000_000);
        assert_eq!(config.limits.chunk_multiplier, 1);

        let test = &config.datasources["test"];
        assert_eq!(test.kind, VolumeKind::Zarr);
        assert_eq!(test.dtype, Dtype::F32);
        assert!(test.provides(ServiceKind::Transform));
        assert!(!test.provides(ServiceKind::Query));

        let zheng = &config.datasources["zheng_ca3_v2"];
        assert_eq!(zheng.kind, VolumeKind::Precomputed);
        assert!(zheng.has_scale(1));
        assert!(!zheng.has_scale(0));

        let flywire = &config.annotations["flywire"];
        assert_eq!(flywire.tables.len(), 2);
        assert_eq!(flywire.versions["630"], "root_630");
        assert_eq!(flywire.bad_status, vec!["duplicate", "bad_nucleus"]);
    }
}
