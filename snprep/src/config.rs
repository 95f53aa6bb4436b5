use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collect::global_variables::{
    BUILDINGS_SUFFIX, COMBINED_CSV_NAME, MASK_SUFFIX, OVERPASS_BACKOFF, OVERPASS_DELAY_SECS,
    OVERPASS_TRIES, OVERPASS_URL, STRETCH_HIGH_PERCENTILE, STRETCH_LOW_PERCENTILE,
    SUPERRES_ALGORITHM, SUPERRES_SCALE,
};
use crate::collect::overpass::retry::RetryPolicy;

/// What to do when a footprint layer and its raster use different CRS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CrsPolicy {
    /// Log the mismatch and burn the footprints unreprojected
    Warn,
    /// Abort the raster with an error
    Fail,
    /// Reproject the footprints into the raster CRS
    #[default]
    Reproject,
}

/// Mask and polygon-table generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskConfig {
    pub raster_dir: PathBuf,
    pub footprint_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_buildings_suffix")]
    pub footprint_suffix: String,
    #[serde(default = "default_mask_suffix")]
    pub mask_suffix: String,
    #[serde(default = "default_csv_name")]
    pub csv_name: String,
    #[serde(default)]
    pub crs_policy: CrsPolicy,
}

impl MaskConfig {
    pub fn new(raster_dir: PathBuf, footprint_dir: PathBuf, output_dir: PathBuf) -> Self {
        MaskConfig {
            raster_dir,
            footprint_dir,
            output_dir,
            footprint_suffix: default_buildings_suffix(),
            mask_suffix: default_mask_suffix(),
            csv_name: default_csv_name(),
            crs_policy: CrsPolicy::default(),
        }
    }

    pub fn csv_path(&self) -> PathBuf {
        self.output_dir.join(&self.csv_name)
    }
}

/// Building footprint retrieval from Overpass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintConfig {
    pub raster_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_tries")]
    pub tries: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_backoff")]
    pub backoff: u32,
}

impl FootprintConfig {
    pub fn new(raster_dir: PathBuf, output_dir: PathBuf) -> Self {
        FootprintConfig {
            raster_dir,
            output_dir,
            endpoint: default_endpoint(),
            tries: default_tries(),
            delay_secs: default_delay_secs(),
            backoff: default_backoff(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.tries, Duration::from_secs(self.delay_secs), self.backoff)
    }

    pub fn shapefile_dir(&self) -> PathBuf {
        self.output_dir.join("shapefiles")
    }

    pub fn geojson_dir(&self) -> PathBuf {
        self.output_dir.join("geojsons")
    }

    pub fn csv_dir(&self) -> PathBuf {
        self.output_dir.join("csvs")
    }
}

/// 8-bit conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitDepthConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_low_percentile")]
    pub low_percentile: f64,
    #[serde(default = "default_high_percentile")]
    pub high_percentile: f64,
}

impl BitDepthConfig {
    pub fn new(input_dir: PathBuf, output_dir: PathBuf) -> Self {
        BitDepthConfig {
            input_dir,
            output_dir,
            low_percentile: default_low_percentile(),
            high_percentile: default_high_percentile(),
        }
    }
}

/// Super-resolution upsampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperResConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model_path: PathBuf,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_scale")]
    pub scale: i32,
    /// Divide the copied pixel size by `scale` instead of copying the transform as is
    #[serde(default)]
    pub rescale_transform: bool,
}

impl SuperResConfig {
    pub fn new(input_dir: PathBuf, output_dir: PathBuf, model_path: PathBuf) -> Self {
        SuperResConfig {
            input_dir,
            output_dir,
            model_path,
            algorithm: default_algorithm(),
            scale: default_scale(),
            rescale_transform: false,
        }
    }
}

/// Load any of the configurations from a JSON file
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config file: {:?}", path))
}

fn default_buildings_suffix() -> String {
    BUILDINGS_SUFFIX.to_string()
}

fn default_mask_suffix() -> String {
    MASK_SUFFIX.to_string()
}

fn default_csv_name() -> String {
    COMBINED_CSV_NAME.to_string()
}

fn default_endpoint() -> String {
    OVERPASS_URL.to_string()
}

fn default_tries() -> u32 {
    OVERPASS_TRIES
}

fn default_delay_secs() -> u64 {
    OVERPASS_DELAY_SECS
}

fn default_backoff() -> u32 {
    OVERPASS_BACKOFF
}

fn default_low_percentile() -> f64 {
    STRETCH_LOW_PERCENTILE
}

fn default_high_percentile() -> f64 {
    STRETCH_HIGH_PERCENTILE
}

fn default_algorithm() -> String {
    SUPERRES_ALGORITHM.to_string()
}

fn default_scale() -> i32 {
    SUPERRES_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_config_defaults_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masks.json");
        std::fs::write(
            &path,
            r#"{"raster_dir": "bbox_paris", "footprint_dir": "shp", "output_dir": "mask"}"#,
        )
        .unwrap();

        let config: MaskConfig = load_json(&path).unwrap();
        assert_eq!(config.footprint_suffix, "_buildings");
        assert_eq!(config.mask_suffix, "_mask");
        assert_eq!(config.crs_policy, CrsPolicy::Reproject);
        assert_eq!(config.csv_path(), PathBuf::from("mask/full_gt_masks_fixed.csv"));
    }

    #[test]
    fn test_crs_policy_from_json() {
        let config: MaskConfig = serde_json::from_str(
            r#"{"raster_dir": "a", "footprint_dir": "b", "output_dir": "c", "crs_policy": "warn"}"#,
        )
        .unwrap();
        assert_eq!(config.crs_policy, CrsPolicy::Warn);
    }

    #[test]
    fn test_footprint_config_layout() {
        let config = FootprintConfig::new("tiles".into(), "paris_csv".into());
        assert_eq!(config.shapefile_dir(), PathBuf::from("paris_csv/shapefiles"));
        assert_eq!(config.geojson_dir(), PathBuf::from("paris_csv/geojsons"));
        assert_eq!(config.csv_dir(), PathBuf::from("paris_csv/csvs"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_missing_config_file() {
        let result: Result<BitDepthConfig> = load_json(Path::new("/nonexistent/snprep.json"));
        assert!(result.is_err());
    }

    #[test]
    fn test_superres_defaults() {
        let config = SuperResConfig::new("in".into(), "out".into(), "EDSR_x2.pb".into());
        assert_eq!(config.algorithm, "edsr");
        assert_eq!(config.scale, 2);
        assert!(!config.rescale_transform);
    }
}
