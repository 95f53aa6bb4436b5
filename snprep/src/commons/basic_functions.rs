use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const RASTER_EXTENSIONS: [&str; 2] = ["tif", "tiff"];

/// Whether the path names a GeoTIFF tile (`.tif` / `.tiff`, any case)
pub fn is_raster(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RASTER_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// List the rasters of a folder, sorted by file name
pub fn list_rasters(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {:?}", dir))?;

    let mut rasters = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to read directory entry in {:?}", dir))?
            .path();
        if path.is_file() && is_raster(&path) {
            rasters.push(path);
        }
    }
    rasters.sort();
    Ok(rasters)
}

/// Create a directory and its parents if absent
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create directory: {:?}", dir))
}

/// File name without its last extension
pub fn file_stem(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("Path has no usable file name: {:?}", path))
}

/// `<stem><suffix>.<ext>`, keeping the source extension
/// (`tile.tif` + `_8bit` -> `tile_8bit.tif`)
pub fn suffixed_name(path: &Path, suffix: &str) -> Result<String> {
    let stem = file_stem(path)?;
    Ok(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext),
        None => format!("{}{}", stem, suffix),
    })
}

/// Image identifier of a mask name: everything before the first `marker`
pub fn image_id(file_name: &str, marker: &str) -> String {
    match file_name.find(marker) {
        Some(idx) => file_name[..idx].to_string(),
        None => file_name.to_string(),
    }
}
