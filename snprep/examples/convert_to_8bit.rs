use anyhow::Result;
use snprep::config::BitDepthConfig;
use snprep::geometric::bit_depth::BitDepthConverter;

/// Example: stretching a folder of 16-bit tiles to 8 bits per band
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("=== Example: 8-bit conversion ===\n");

    let mut config = BitDepthConfig::new("./data/tiles".into(), "./output/tiles_8bit".into());
    config.low_percentile = 2.0;
    config.high_percentile = 98.0;

    let outputs = BitDepthConverter::new(config).run()?;

    println!("\n{} rasters converted:", outputs.len());
    for path in &outputs {
        println!("  - {:?}", path);
    }

    Ok(())
}
