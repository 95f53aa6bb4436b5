use anyhow::{Context, Result};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::collect::global_variables::EIGHT_BIT_SUFFIX;
use crate::commons::basic_functions::{ensure_dir, list_rasters, suffixed_name};
use crate::commons::progress::BatchProgress;
use crate::config::BitDepthConfig;

/// Percentile of already sorted values, linearly interpolated between ranks
pub fn percentile(sorted: &[f64], pct: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Stretch window `(low, high)` over the valid pixels of a band
pub fn stretch_window(values: &[f64], nodata: Option<f64>, low_pct: f64, high_pct: f64) -> Option<(f64, f64)> {
    let mut valid: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| !v.is_nan() && Some(*v) != nodata)
        .collect();
    valid.sort_by(f64::total_cmp);
    Some((percentile(&valid, low_pct)?, percentile(&valid, high_pct)?))
}

/// Linear rescale of `[low, high]` onto `[0, 255]`, clamped.
/// Nodata, NaN and constant bands map to 0.
pub fn rescale_to_u8(values: &[f64], nodata: Option<f64>, low: f64, high: f64) -> Vec<u8> {
    let span = high - low;
    values
        .iter()
        .map(|&v| {
            if v.is_nan() || Some(v) == nodata || span <= 0.0 {
                return 0;
            }
            ((v - low) / span * 255.0).round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Convert every band of `input` to Byte with a per-band percentile stretch,
/// keeping its geotransform and projection
pub fn convert_to_8bit(input: &Path, output: &Path, low_pct: f64, high_pct: f64) -> Result<()> {
    let source =
        Dataset::open(input).with_context(|| format!("Failed to open raster: {:?}", input))?;
    let (width, height) = source.raster_size();
    let band_count = source.raster_count();
    if band_count == 0 {
        anyhow::bail!("Raster {:?} has no bands", input);
    }

    let driver =
        DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;
    let mut target = driver
        .create_with_band_type::<u8, _>(output, width, height, band_count)
        .with_context(|| format!("Failed to create GeoTIFF dataset: {:?}", output))?;

    if let Ok(geo_transform) = source.geo_transform() {
        target
            .set_geo_transform(&geo_transform)
            .context("Failed to set geotransform")?;
    }
    let projection = source.projection();
    if !projection.is_empty() {
        target
            .set_projection(&projection)
            .context("Failed to set projection")?;
    }

    for band_index in 1..=band_count {
        let band = source
            .rasterband(band_index)
            .with_context(|| format!("Failed to get band {}", band_index))?;
        let nodata = band.no_data_value();
        let buffer = band
            .read_as::<f64>((0, 0), (width, height), (width, height), None)
            .with_context(|| format!("Failed to read band {}", band_index))?;

        let (low, high) =
            stretch_window(buffer.data(), nodata, low_pct, high_pct).unwrap_or((0.0, 0.0));
        debug!("{:?} band {}: stretch [{}, {}]", input, band_index, low, high);

        let mut out = Buffer::new((width, height), rescale_to_u8(buffer.data(), nodata, low, high));
        let mut out_band = target
            .rasterband(band_index)
            .with_context(|| format!("Failed to get output band {}", band_index))?;
        out_band
            .write((0, 0), (width, height), &mut out)
            .with_context(|| format!("Failed to write band {}", band_index))?;
    }

    Ok(())
}

/// Folder-level 8-bit conversion
pub struct BitDepthConverter {
    config: BitDepthConfig,
}

impl BitDepthConverter {
    pub fn new(config: BitDepthConfig) -> Self {
        BitDepthConverter { config }
    }

    /// `tile.tif` -> `<output_dir>/tile_8bit.tif`
    pub fn output_path(&self, input: &Path) -> Result<PathBuf> {
        Ok(self
            .config
            .output_dir
            .join(suffixed_name(input, EIGHT_BIT_SUFFIX)?))
    }

    /// Convert every raster of the input folder; returns the written paths
    pub fn run(&self) -> Result<Vec<PathBuf>> {
        ensure_dir(&self.config.output_dir)?;
        let inputs = list_rasters(&self.config.input_dir)?;

        let progress = BatchProgress::new(inputs.len(), "8-bit");
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let output = self.output_path(input)?;
            convert_to_8bit(
                input,
                &output,
                self.config.low_percentile,
                self.config.high_percentile,
            )?;
            info!("Converted: {:?} -> {:?}", input, output);
            outputs.push(output);
            progress.inc();
        }
        progress.finish("All rasters converted");
        Ok(outputs)
    }
}
