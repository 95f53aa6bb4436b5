use anyhow::Result;
use snprep::config::{CrsPolicy, MaskConfig};
use snprep::geometric::mask::MaskGenerator;

/// Example: building masks and the combined polygon CSV from tiles and shapefiles
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("=== Example: masks from a tile folder ===\n");

    // Footprints are looked up as <footprint_dir>/<tile stem>_buildings.shp
    let mut config = MaskConfig::new(
        "./data/tiles_8bit".into(),
        "./output/footprints/shapefiles".into(),
        "./output/masks".into(),
    );
    config.crs_policy = CrsPolicy::Reproject;

    let table = MaskGenerator::new(config.clone()).run()?;

    println!("\nMasks written to {:?}", config.output_dir);
    println!("  - Polygons: {}", table.len());
    println!("  - Table: {:?}", config.csv_path());

    Ok(())
}
