use anyhow::{Context, Result};
use geo::Polygon;
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, Value};
use log::{error, info, warn};
use serde_json::Map;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::collect::global_variables::BUILDINGS_SUFFIX;
use crate::collect::overpass::overpass_collect::{
    fetch_buildings, BuildingWay, OverpassApi, OverpassCollect,
};
use crate::collect::overpass::retry::RetryPolicy;
use crate::commons::basic_functions::{ensure_dir, file_stem, list_rasters};
use crate::commons::polygon_table::{PolygonTable, CONFIDENCE};
use crate::commons::progress::BatchProgress;
use crate::config::FootprintConfig;
use crate::geo_core::{crs_proj, transform_polygon, BoundingBox, RasterInfo, WGS84_EPSG};

/// Geographic (EPSG:4326) extent of a raster tile.
/// Rasters without an identifiable CRS are taken to be in lon/lat already.
pub fn tile_extent_wgs84(raster: &RasterInfo) -> Result<BoundingBox> {
    let extent = raster.extent();
    match raster.epsg {
        Some(WGS84_EPSG) => Ok(extent),
        Some(epsg) => extent.transform(epsg, WGS84_EPSG),
        None => {
            warn!("Raster has no EPSG code, using its extent as lon/lat");
            Ok(extent)
        }
    }
}

/// Lon/lat polygons expressed in the pixel grid of `raster`
pub fn wgs84_to_pixels(raster: &RasterInfo, polygons: &[Polygon<f64>]) -> Result<Vec<Polygon<f64>>> {
    let inverse = raster.transform.inverse()?;
    let proj = match raster.epsg {
        Some(epsg) if epsg != WGS84_EPSG => Some(crs_proj(WGS84_EPSG, epsg)?),
        _ => None,
    };

    polygons
        .iter()
        .map(|polygon| -> Result<Polygon<f64>> {
            let projected = match proj {
                Some(ref proj) => transform_polygon(proj, polygon)?,
                None => polygon.clone(),
            };
            Ok(inverse.apply_polygon(&projected))
        })
        .collect()
}

/// Buildings as an EPSG:4326 FeatureCollection carrying the table fields
pub fn buildings_to_geojson(image_id: &str, ways: &[BuildingWay]) -> GeoJson {
    let features = ways
        .iter()
        .enumerate()
        .map(|(idx, way)| {
            let mut properties = Map::new();
            properties.insert("ImageId".to_string(), image_id.into());
            properties.insert("BuildingId".to_string(), (idx + 1).into());
            properties.insert("Confidence".to_string(), CONFIDENCE.into());
            properties.insert("osm_id".to_string(), way.id.into());

            let mut feature = Feature::from(Geometry::new(Value::from(&way.polygon)));
            feature.properties = Some(properties);
            feature
        })
        .collect();

    GeoJson::from(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}

/// Convert a GeoJSON file to an ESRI Shapefile in EPSG:4326 with ogr2ogr
pub fn export_shapefile(geojson_path: &Path, shapefile_path: &Path) -> Result<()> {
    // ogr2ogr refuses to overwrite a partial shapefile, remove every component first
    for ext in ["shp", "shx", "dbf", "prj", "cpg"] {
        let component = shapefile_path.with_extension(ext);
        if component.exists() {
            std::fs::remove_file(&component)
                .with_context(|| format!("Failed to remove stale shapefile part: {:?}", component))?;
        }
    }

    let status = Command::new("ogr2ogr")
        .arg("-f")
        .arg("ESRI Shapefile")
        .arg("-a_srs")
        .arg(format!("EPSG:{}", WGS84_EPSG))
        .arg(shapefile_path)
        .arg(geojson_path)
        .status()
        .context("Failed to execute ogr2ogr. Make sure GDAL is installed and ogr2ogr is in PATH")?;

    if !status.success() {
        anyhow::bail!(
            "ogr2ogr failed to convert {:?} to shapefile {:?}",
            geojson_path,
            shapefile_path
        );
    }
    Ok(())
}

/// Outcome of a footprint retrieval batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FootprintSummary {
    pub tiles_ok: usize,
    pub tiles_failed: Vec<String>,
    pub buildings: usize,
}

/// Building footprint retrieval, one Overpass query per raster tile
pub struct FootprintCollector<A: OverpassApi> {
    api: A,
    config: FootprintConfig,
    retry: RetryPolicy,
    /// Also convert the GeoJSON output to a shapefile
    pub write_shapefile: bool,
}

impl FootprintCollector<OverpassCollect> {
    /// Collector talking to the endpoint named in `config`
    pub fn from_config(config: FootprintConfig) -> Result<Self> {
        let api = OverpassCollect::new(Some(config.endpoint.clone()))?;
        Ok(FootprintCollector::new(api, config))
    }
}

impl<A: OverpassApi> FootprintCollector<A> {
    pub fn new(api: A, config: FootprintConfig) -> Self {
        let retry = config.retry_policy();
        FootprintCollector {
            api,
            config,
            retry,
            write_shapefile: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn output_path(&self, dir: PathBuf, stem: &str, ext: &str) -> PathBuf {
        dir.join(format!("{}{}.{}", stem, BUILDINGS_SUFFIX, ext))
    }

    /// Query and persist the buildings of one tile; returns how many were kept.
    ///
    /// The GeoJSON and shapefile stay in lon/lat. The CSV uses the mask table
    /// layout instead: `PolygonWKT_Pix` holds pixel coordinates of the tile with
    /// a zero z, not the lon/lat WKT older per-tile CSVs carried.
    pub fn process_tile(&self, raster_path: &Path) -> Result<usize> {
        let raster = RasterInfo::open(raster_path)?;
        let stem = file_stem(raster_path)?;
        let bbox = tile_extent_wgs84(&raster)?;
        info!(
            "Querying buildings for {} in ({:.6}, {:.6}, {:.6}, {:.6})",
            stem, bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y
        );

        let ways = fetch_buildings(&self.api, &self.retry, &bbox)
            .with_context(|| format!("Overpass query failed for {}", stem))?;

        let geojson_path = self.output_path(self.config.geojson_dir(), &stem, "geojson");
        std::fs::write(&geojson_path, buildings_to_geojson(&stem, &ways).to_string())
            .with_context(|| format!("Failed to write GeoJSON file: {:?}", geojson_path))?;

        let lonlat: Vec<Polygon<f64>> = ways.iter().map(|w| w.polygon.clone()).collect();
        let mut table = PolygonTable::new();
        table.push_image(&stem, &wgs84_to_pixels(&raster, &lonlat)?);
        let csv_path = self.output_path(self.config.csv_dir(), &stem, "csv");
        table.write_csv(&csv_path)?;

        if self.write_shapefile {
            let shapefile_path = self.output_path(self.config.shapefile_dir(), &stem, "shp");
            export_shapefile(&geojson_path, &shapefile_path)?;
        }

        Ok(ways.len())
    }

    /// Process every tile of `raster_dir`. A failing tile is logged and skipped.
    pub fn run(&self) -> Result<FootprintSummary> {
        let rasters = list_rasters(&self.config.raster_dir)?;
        for dir in [
            self.config.shapefile_dir(),
            self.config.geojson_dir(),
            self.config.csv_dir(),
        ] {
            ensure_dir(&dir)?;
        }

        let progress = BatchProgress::new(rasters.len(), "Tiles");
        let mut summary = FootprintSummary::default();
        for raster_path in &rasters {
            let name = raster_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match self.process_tile(raster_path) {
                Ok(count) => {
                    info!("Shapefile and CSV saved for TIFF file: {} ({} buildings)", name, count);
                    summary.tiles_ok += 1;
                    summary.buildings += count;
                }
                Err(e) => {
                    error!("Error for TIFF file {}: {:#}", name, e);
                    summary.tiles_failed.push(name);
                }
            }
            progress.inc();
        }
        progress.finish("All tiles processed");

        info!(
            "{} tiles saved, {} failed, {} buildings",
            summary.tiles_ok,
            summary.tiles_failed.len(),
            summary.buildings
        );
        Ok(summary)
    }
}
