use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};

use snprep::collect::global_variables::{
    BUILDINGS_SUFFIX, COMBINED_CSV_NAME, MASK_SUFFIX, OVERPASS_BACKOFF, OVERPASS_DELAY_SECS,
    OVERPASS_TRIES, OVERPASS_URL, STRETCH_HIGH_PERCENTILE, STRETCH_LOW_PERCENTILE,
    SUPERRES_ALGORITHM, SUPERRES_SCALE,
};
use snprep::config::{load_json, BitDepthConfig, CrsPolicy, FootprintConfig, MaskConfig};
use snprep::geometric::bit_depth::BitDepthConverter;
use snprep::geometric::footprint::FootprintCollector;
use snprep::geometric::mask::MaskGenerator;

#[derive(Parser, Debug)]
#[command(name = "snprep", version, about = "SpaceNet-style building dataset preparation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stretch rasters to 8 bits per band
    Convert(ConvertArgs),
    /// Burn footprints into PNG masks and build the polygon CSV
    Masks(MaskArgs),
    /// Download OSM building footprints for every raster tile
    Footprints(FootprintArgs),
    /// Upsample rasters with a dnn_superres model
    Superres(SuperResArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// JSON configuration; replaces every other flag
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    input_dir: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value_t = STRETCH_LOW_PERCENTILE)]
    low_percentile: f64,

    #[arg(long, default_value_t = STRETCH_HIGH_PERCENTILE)]
    high_percentile: f64,
}

#[derive(Args, Debug)]
struct MaskArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder of GeoTIFF tiles
    #[arg(long, required_unless_present = "config")]
    raster_dir: Option<PathBuf>,

    /// Folder of `<stem>_buildings.shp` / `.geojson` footprints
    #[arg(long, required_unless_present = "config")]
    footprint_dir: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = BUILDINGS_SUFFIX)]
    footprint_suffix: String,

    #[arg(long, default_value = MASK_SUFFIX)]
    mask_suffix: String,

    #[arg(long, default_value = COMBINED_CSV_NAME)]
    csv_name: String,

    #[arg(long, value_enum, default_value_t = CrsPolicy::Reproject)]
    crs_policy: CrsPolicy,
}

#[derive(Args, Debug)]
struct FootprintArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    raster_dir: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = OVERPASS_URL)]
    endpoint: String,

    #[arg(long, default_value_t = OVERPASS_TRIES)]
    tries: u32,

    /// Seconds before the first retry
    #[arg(long, default_value_t = OVERPASS_DELAY_SECS)]
    delay: u64,

    #[arg(long, default_value_t = OVERPASS_BACKOFF)]
    backoff: u32,

    /// Skip the ogr2ogr shapefile export
    #[arg(long, default_value_t = false)]
    no_shapefile: bool,
}

#[derive(Args, Debug)]
struct SuperResArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    input_dir: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    output_dir: Option<PathBuf>,

    /// Pretrained model, e.g. EDSR_x2.pb
    #[arg(long, required_unless_present = "config")]
    model: Option<PathBuf>,

    #[arg(long, default_value = SUPERRES_ALGORITHM)]
    algorithm: String,

    #[arg(long, default_value_t = SUPERRES_SCALE)]
    scale: i32,

    /// Divide the pixel size of the copied geotransform by the scale
    #[arg(long, default_value_t = false)]
    rescale_transform: bool,
}

fn required(value: Option<PathBuf>, flag: &str) -> Result<PathBuf> {
    value.with_context(|| format!("--{} is required without --config", flag))
}

fn from_file_or<T, F>(config: Option<&Path>, from_flags: F) -> Result<T>
where
    T: serde::de::DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    match config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            load_json(path)
        }
        None => from_flags(),
    }
}

fn convert(args: ConvertArgs) -> Result<()> {
    let config = from_file_or(args.config.as_deref(), || {
        let mut config = BitDepthConfig::new(
            required(args.input_dir, "input-dir")?,
            required(args.output_dir, "output-dir")?,
        );
        config.low_percentile = args.low_percentile;
        config.high_percentile = args.high_percentile;
        Ok(config)
    })?;

    let outputs = BitDepthConverter::new(config).run()?;
    info!("{} rasters converted to 8 bits", outputs.len());
    Ok(())
}

fn masks(args: MaskArgs) -> Result<()> {
    let config = from_file_or(args.config.as_deref(), || {
        let mut config = MaskConfig::new(
            required(args.raster_dir, "raster-dir")?,
            required(args.footprint_dir, "footprint-dir")?,
            required(args.output_dir, "output-dir")?,
        );
        config.footprint_suffix = args.footprint_suffix;
        config.mask_suffix = args.mask_suffix;
        config.csv_name = args.csv_name;
        config.crs_policy = args.crs_policy;
        Ok(config)
    })?;

    let table = MaskGenerator::new(config).run()?;
    info!("{} building polygons written", table.len());
    Ok(())
}

fn footprints(args: FootprintArgs) -> Result<()> {
    let config = from_file_or(args.config.as_deref(), || {
        let mut config = FootprintConfig::new(
            required(args.raster_dir, "raster-dir")?,
            required(args.output_dir, "output-dir")?,
        );
        config.endpoint = args.endpoint;
        config.tries = args.tries;
        config.delay_secs = args.delay;
        config.backoff = args.backoff;
        Ok(config)
    })?;

    let mut collector = FootprintCollector::from_config(config)?;
    collector.write_shapefile = !args.no_shapefile;
    let summary = collector.run()?;
    info!(
        "{} tiles processed, {} buildings",
        summary.tiles_ok, summary.buildings
    );
    if !summary.tiles_failed.is_empty() {
        warn!("{} tiles failed: {}", summary.tiles_failed.len(), summary.tiles_failed.join(", "));
    }
    Ok(())
}

#[cfg(feature = "superres")]
fn superres(args: SuperResArgs) -> Result<()> {
    use snprep::config::SuperResConfig;
    use snprep::geometric::super_res::SuperResolution;

    let config = from_file_or(args.config.as_deref(), || {
        let mut config = SuperResConfig::new(
            required(args.input_dir, "input-dir")?,
            required(args.output_dir, "output-dir")?,
            required(args.model, "model")?,
        );
        config.algorithm = args.algorithm;
        config.scale = args.scale;
        config.rescale_transform = args.rescale_transform;
        Ok(config)
    })?;

    let outputs = SuperResolution::new(config)?.run()?;
    info!("{} rasters upsampled", outputs.len());
    Ok(())
}

#[cfg(not(feature = "superres"))]
fn superres(args: SuperResArgs) -> Result<()> {
    let _ = args;
    anyhow::bail!("snprep was built without the `superres` feature")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Convert(args) => convert(args),
        Command::Masks(args) => masks(args),
        Command::Footprints(args) => footprints(args),
        Command::Superres(args) => superres(args),
    }
}
