use anyhow::{Context, Result};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags};
use log::{debug, info};
use opencv::core::{Mat, Vector};
use opencv::dnn_superres::DnnSuperResImpl;
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};
use std::path::{Path, PathBuf};

use crate::collect::global_variables::UPSAMPLED_SUFFIX;
use crate::commons::basic_functions::{ensure_dir, list_rasters, suffixed_name};
use crate::commons::progress::BatchProgress;
use crate::config::SuperResConfig;
use crate::geo_core::GeoTransform;

/// Geotransform for the upsampled raster: copied as is, or with the pixel
/// size divided by the model scale when `rescale` is set
pub fn output_geo_transform(source: [f64; 6], scale: i32, rescale: bool) -> [f64; 6] {
    if rescale && scale > 0 {
        GeoTransform::new(source).scaled(f64::from(scale)).coeffs()
    } else {
        source
    }
}

/// Read an image with OpenCV, dropping the alpha channel of BGRA inputs
fn read_bgr(path: &Path) -> Result<Mat> {
    let path_str = path
        .to_str()
        .with_context(|| format!("Non UTF-8 path: {:?}", path))?;
    let image = imgcodecs::imread(path_str, imgcodecs::IMREAD_UNCHANGED)
        .with_context(|| format!("Failed to read image: {:?}", path))?;
    if image.empty() {
        anyhow::bail!("Unreadable image: {:?}", path);
    }

    if image.channels() == 4 {
        let mut bgr = Mat::default();
        imgproc::cvt_color(&image, &mut bgr, imgproc::COLOR_BGRA2BGR, 0)?;
        debug!("Converted {:?} from 4 channels to 3 channels", path);
        return Ok(bgr);
    }
    Ok(image)
}

/// Pretrained `dnn_superres` model applied to a folder of GeoTIFFs
pub struct SuperResolution {
    config: SuperResConfig,
    model: opencv::core::Ptr<DnnSuperResImpl>,
}

impl SuperResolution {
    /// Load the model once for the whole batch
    pub fn new(config: SuperResConfig) -> Result<Self> {
        let model_path = config
            .model_path
            .to_str()
            .with_context(|| format!("Non UTF-8 model path: {:?}", config.model_path))?
            .to_string();

        let mut model = DnnSuperResImpl::create().context("Failed to create dnn_superres")?;
        model
            .read_model(&model_path)
            .with_context(|| format!("Failed to read model: {}", model_path))?;
        model
            .set_model(&config.algorithm, config.scale)
            .with_context(|| format!("Failed to set model {} x{}", config.algorithm, config.scale))?;
        info!("Loaded {} x{} model from {}", config.algorithm, config.scale, model_path);

        Ok(SuperResolution { config, model })
    }

    pub fn output_path(&self, input: &Path) -> Result<PathBuf> {
        Ok(self
            .config
            .output_dir
            .join(suffixed_name(input, UPSAMPLED_SUFFIX)?))
    }

    /// Upsample one raster and copy its georeferencing onto the result
    pub fn upsample_file(&mut self, input: &Path) -> Result<PathBuf> {
        let image = read_bgr(input)?;

        let source =
            Dataset::open(input).with_context(|| format!("Failed to open raster: {:?}", input))?;
        let geo_transform = source
            .geo_transform()
            .with_context(|| format!("Raster has no geotransform: {:?}", input))?;
        let projection = source.projection();

        let mut result = Mat::default();
        self.model
            .upsample(&image, &mut result)
            .with_context(|| format!("Upsampling failed: {:?}", input))?;

        let output = self.output_path(input)?;
        let output_str = output
            .to_str()
            .with_context(|| format!("Non UTF-8 path: {:?}", output))?;
        let written = imgcodecs::imwrite(output_str, &result, &Vector::<i32>::new())
            .with_context(|| format!("Failed to write image: {:?}", output))?;
        if !written {
            anyhow::bail!("OpenCV could not encode {:?}", output);
        }

        let mut target = Dataset::open_ex(
            &output,
            DatasetOptions {
                open_flags: GdalOpenFlags::GDAL_OF_UPDATE,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to reopen output: {:?}", output))?;
        target
            .set_geo_transform(&output_geo_transform(
                geo_transform,
                self.config.scale,
                self.config.rescale_transform,
            ))
            .context("Failed to set geotransform")?;
        target
            .set_projection(&projection)
            .context("Failed to set projection")?;

        Ok(output)
    }

    pub fn run(&mut self) -> Result<Vec<PathBuf>> {
        ensure_dir(&self.config.output_dir)?;
        let inputs = list_rasters(&self.config.input_dir)?;

        let progress = BatchProgress::new(inputs.len(), "Super-resolution");
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let output = self.upsample_file(input)?;
            info!("Processed and saved: {:?}", output);
            outputs.push(output);
            progress.inc();
        }
        progress.finish("All rasters upsampled");
        Ok(outputs)
    }
}
