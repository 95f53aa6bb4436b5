use anyhow::Result;
use snprep::config::FootprintConfig;
use snprep::geometric::footprint::FootprintCollector;

/// Example: downloading OSM building footprints for every tile of a folder
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("=== Example: footprints from Overpass ===\n");

    let mut config = FootprintConfig::new("./data/tiles".into(), "./output/footprints".into());
    config.tries = 5;

    let mut collector = FootprintCollector::from_config(config)?;
    // GeoJSON and CSV only, no ogr2ogr needed
    collector.write_shapefile = false;
    let summary = collector.run()?;

    println!("\nFootprints retrieved:");
    println!("  - Tiles ok: {}", summary.tiles_ok);
    println!("  - Tiles failed: {:?}", summary.tiles_failed);
    println!("  - Buildings: {}", summary.buildings);

    Ok(())
}
