use anyhow::Result;
use snprep::config::SuperResConfig;
use snprep::geometric::super_res::SuperResolution;

/// Example: 2x EDSR upsampling of 8-bit tiles
/// Run with `cargo run --example superres_folder --features superres`
fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("=== Example: super-resolution ===\n");

    let config = SuperResConfig::new(
        "./output/tiles_8bit".into(),
        "./output/tiles_sr".into(),
        "./models/EDSR_x2.pb".into(),
    );

    let outputs = SuperResolution::new(config)?.run()?;
    println!("\n{} rasters upsampled", outputs.len());

    Ok(())
}
