use anyhow::{Context, Result};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{BoundingRect, LineString, Polygon};
use geojson::GeoJson;
use image::GrayImage;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::commons::basic_functions::{ensure_dir, file_stem, image_id, list_rasters};
use crate::commons::polygon_table::PolygonTable;
use crate::commons::progress::BatchProgress;
use crate::config::{CrsPolicy, MaskConfig};
use crate::error::CrsMismatch;
use crate::geo_core::{crs_proj, epsg_of, same_crs, transform_polygon, RasterInfo};

/// Mask value of building pixels
pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Footprint polygons of one vector file, with the CRS they are expressed in
#[derive(Debug, Clone, Default)]
pub struct Footprints {
    pub polygons: Vec<Polygon<f64>>,
    pub epsg: Option<i32>,
    /// WKT of the layer CRS, empty when the layer has none
    pub wkt: String,
}

impl Footprints {
    /// Read every polygon of the first layer of a shapefile or GeoJSON.
    /// Multi-polygons contribute each member; other geometry types are skipped.
    /// A missing or zero-length file reads as no footprints.
    pub fn read(path: &Path) -> Result<Self> {
        let is_empty_file = std::fs::metadata(path).map(|m| m.len() == 0);
        match is_empty_file {
            Err(_) => {
                info!("No footprint file at {:?}, mask will be empty", path);
                return Ok(Footprints::default());
            }
            Ok(true) => {
                info!("Footprint file {:?} is empty, mask will be empty", path);
                return Ok(Footprints::default());
            }
            Ok(false) => {}
        }

        let dataset = Dataset::open(path)
            .with_context(|| format!("Failed to open footprint file: {:?}", path))?;
        if dataset.layer_count() == 0 {
            return Ok(Footprints::default());
        }
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("Failed to get layer from {:?}", path))?;

        let (epsg, wkt) = match layer.spatial_ref() {
            Some(srs) => {
                let wkt = srs.to_wkt().unwrap_or_default();
                (epsg_of(srs), wkt)
            }
            None => (None, String::new()),
        };

        let mut polygons = Vec::new();
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            let json = geometry
                .json()
                .context("Failed to export footprint geometry as GeoJSON")?;
            let geo_geom = match json.parse::<GeoJson>() {
                Ok(GeoJson::Geometry(g)) => geo::Geometry::<f64>::try_from(g)
                    .context("Failed to convert GeoJSON geometry to geo::Geometry")?,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping unreadable footprint geometry in {:?}: {}", path, e);
                    continue;
                }
            };
            match geo_geom {
                geo::Geometry::Polygon(poly) => polygons.push(poly),
                geo::Geometry::MultiPolygon(mp) => polygons.extend(mp.0),
                other => debug!("Skipping non-polygonal footprint: {:?}", other),
            }
        }

        Ok(Footprints {
            polygons,
            epsg,
            wkt,
        })
    }

    fn crs_label(&self) -> String {
        crs_label(self.epsg, &self.wkt)
    }
}

fn crs_label(epsg: Option<i32>, wkt: &str) -> String {
    match epsg {
        Some(code) => format!("EPSG:{}", code),
        None if wkt.is_empty() => "undefined".to_string(),
        None => wkt.to_string(),
    }
}

/// Bring footprints into the raster CRS according to `policy`
pub fn align_footprints(
    raster: &RasterInfo,
    footprints: Footprints,
    policy: CrsPolicy,
) -> Result<Vec<Polygon<f64>>> {
    if footprints.polygons.is_empty()
        || same_crs(raster.epsg, &raster.projection, footprints.epsg, &footprints.wkt)
    {
        return Ok(footprints.polygons);
    }

    let mismatch = CrsMismatch {
        raster: crs_label(raster.epsg, &raster.projection),
        vector: footprints.crs_label(),
    };
    let vector_has_crs = footprints.epsg.is_some() || !footprints.wkt.is_empty();

    match policy {
        CrsPolicy::Fail => Err(mismatch.into()),
        CrsPolicy::Warn => {
            warn!("{}", mismatch);
            Ok(footprints.polygons)
        }
        CrsPolicy::Reproject if !vector_has_crs => {
            warn!("Footprints have no CRS, assuming {}", mismatch.raster);
            Ok(footprints.polygons)
        }
        CrsPolicy::Reproject => {
            let (Some(from), Some(to)) = (footprints.epsg, raster.epsg) else {
                return Err(anyhow::Error::new(mismatch)
                    .context("Cannot reproject footprints without EPSG codes on both sides"));
            };
            info!("Reprojecting footprints EPSG:{} -> EPSG:{}", from, to);
            let proj = crs_proj(from, to)?;
            footprints
                .polygons
                .iter()
                .map(|p| transform_polygon(&proj, p))
                .collect()
        }
    }
}

/// Exterior ring of a map-space polygon expressed in pixel coordinates.
/// Holes are not kept: a footprint record is its outline.
pub fn polygon_to_pixels(raster: &RasterInfo, polygon: &Polygon<f64>) -> Result<Polygon<f64>> {
    let inverse = raster.transform.inverse()?;
    let outline = Polygon::new(polygon.exterior().clone(), vec![]);
    Ok(inverse.apply_polygon(&outline))
}

/// Burn pixel-space polygons into a row-major `height x width` mask.
///
/// Scanline fill at pixel centers with half-open spans: a center on a left or
/// top edge is inside, one on a right or bottom edge is not. This matches
/// GDAL rasterization, so a footprint `n` pixels wide burns `n` columns.
pub fn rasterize(polygons: &[Polygon<f64>], width: usize, height: usize) -> Vec<u8> {
    let mut mask = vec![BACKGROUND; width * height];
    if width == 0 || height == 0 {
        return mask;
    }

    for polygon in polygons {
        let Some(rect) = polygon.bounding_rect() else {
            continue;
        };
        // Pixel centers sit at col + 0.5, row + 0.5
        let min_row = (rect.min().y - 0.5).ceil().max(0.0);
        let max_row = (rect.max().y - 0.5).floor().min(height as f64 - 1.0);
        if min_row > max_row {
            continue;
        }

        let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors())
            .collect();
        let mut crossings = Vec::new();
        for row in min_row as usize..=max_row as usize {
            let center_y = row as f64 + 0.5;
            crossings.clear();
            for line in rings.iter().flat_map(|ring| ring.lines()) {
                let (a, b) = (line.start, line.end);
                if (a.y <= center_y && center_y < b.y) || (b.y <= center_y && center_y < a.y) {
                    crossings.push(a.x + (center_y - a.y) * (b.x - a.x) / (b.y - a.y));
                }
            }
            crossings.sort_by(f64::total_cmp);

            for span in crossings.chunks_exact(2) {
                let first = (span[0] - 0.5).ceil().max(0.0) as usize;
                let last = ((span[1] - 0.5).ceil().min(width as f64)) as usize;
                for col in first..last {
                    mask[row * width + col] = FOREGROUND;
                }
            }
        }
    }
    mask
}

/// Write a mask buffer as an 8-bit grayscale PNG
pub fn write_mask_png(mask: Vec<u8>, width: usize, height: usize, path: &Path) -> Result<()> {
    let image = GrayImage::from_raw(width as u32, height as u32, mask)
        .context("Mask buffer does not match raster size")?;
    image
        .save(path)
        .with_context(|| format!("Failed to write mask: {:?}", path))
}

/// Mask and polygon-table generator
pub struct MaskGenerator {
    config: MaskConfig,
}

impl MaskGenerator {
    pub fn new(config: MaskConfig) -> Self {
        MaskGenerator { config }
    }

    /// Footprint file of a raster: `<stem><suffix>.shp`, or `.geojson` when only that exists
    pub fn footprint_path(&self, raster_path: &Path) -> Result<PathBuf> {
        let base = format!("{}{}", file_stem(raster_path)?, self.config.footprint_suffix);
        let shp = self.config.footprint_dir.join(format!("{}.shp", base));
        if shp.exists() {
            return Ok(shp);
        }
        let geojson = self.config.footprint_dir.join(format!("{}.geojson", base));
        if geojson.exists() {
            return Ok(geojson);
        }
        Ok(shp)
    }

    /// Generate `<output_dir>/<file_name>.png` for one raster and append its
    /// footprints, in pixel space, to `table`.
    pub fn generate_mask(
        &self,
        raster_path: &Path,
        footprint_path: &Path,
        file_name: &str,
        mut table: PolygonTable,
    ) -> Result<PolygonTable> {
        let raster = RasterInfo::open(raster_path)?;
        let footprints = Footprints::read(footprint_path)?;
        let polygons = align_footprints(&raster, footprints, self.config.crs_policy)
            .with_context(|| format!("Footprints of {:?} do not match the raster", raster_path))?;

        let pixel_polygons = polygons
            .iter()
            .map(|p| polygon_to_pixels(&raster, p))
            .collect::<Result<Vec<_>>>()?;

        let mask = rasterize(&pixel_polygons, raster.width, raster.height);
        ensure_dir(&self.config.output_dir)?;
        let png_path = self.config.output_dir.join(format!("{}.png", file_name));
        write_mask_png(mask, raster.width, raster.height, &png_path)?;

        table.push_image(&image_id(file_name, &self.config.mask_suffix), &pixel_polygons);
        debug!(
            "{:?}: {} footprints burned into {:?}",
            raster_path,
            pixel_polygons.len(),
            png_path
        );
        Ok(table)
    }

    /// Process every raster of `raster_dir` and write the combined table once
    pub fn run(&self) -> Result<PolygonTable> {
        let rasters = list_rasters(&self.config.raster_dir)?;
        info!(
            "Generating masks for {} rasters from {:?}",
            rasters.len(),
            self.config.raster_dir
        );

        let progress = BatchProgress::new(rasters.len(), "Masks");
        let mut table = PolygonTable::new();
        for raster_path in &rasters {
            let footprint_path = self.footprint_path(raster_path)?;
            let file_name = format!("{}{}", file_stem(raster_path)?, self.config.mask_suffix);
            table = self.generate_mask(raster_path, &footprint_path, &file_name, table)?;
            info!("{:?} mask processed", raster_path.file_name().unwrap_or_default());
            progress.inc();
        }
        progress.finish("All masks processed");

        let csv_path = self.config.csv_path();
        table.write_csv(&csv_path)?;
        info!("Polygon table with {} rows saved to {:?}", table.len(), csv_path);
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::GeoTransform;
    use gdal::spatial_ref::SpatialRef;
    use gdal::DriverManager;
    use geo::polygon;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    // 100 x 100 tile of 1e-5 degree pixels over Paris
    fn tile_info() -> RasterInfo {
        RasterInfo {
            width: 100,
            height: 100,
            transform: GeoTransform::from_origin(2.3, 48.9, 1e-5, 1e-5),
            projection: String::new(),
            epsg: Some(4326),
        }
    }

    fn write_tile(path: &Path) {
        let info = tile_info();
        let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
        let mut dataset = driver
            .create_with_band_type::<u8, _>(path, info.width, info.height, 1)
            .unwrap();
        dataset
            .set_geo_transform(&info.transform.coeffs())
            .unwrap();
        dataset
            .set_spatial_ref(&SpatialRef::from_epsg(4326).unwrap())
            .unwrap();
    }

    fn write_footprints(path: &Path, polygons: &[Polygon<f64>]) {
        let features: Vec<geojson::Feature> = polygons
            .iter()
            .map(|p| geojson::Feature::from(geojson::Geometry::new(geojson::Value::from(p))))
            .collect();
        let fc = geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        std::fs::write(path, GeoJson::from(fc).to_string()).unwrap();
    }

    #[test]
    fn test_rasterize_no_polygons() {
        let mask = rasterize(&[], 8, 6);
        assert_eq!(mask.len(), 48);
        assert!(mask.iter().all(|&v| v == BACKGROUND));
    }

    #[test]
    fn test_rasterize_square() {
        // pixel corners 2..5 cover pixel centers 2.5, 3.5, 4.5
        let mask = rasterize(&[square(2.0, 1.0, 3.0)], 10, 10);
        let on: usize = mask.iter().filter(|&&v| v == FOREGROUND).count();
        assert_eq!(on, 9);
        assert_eq!(mask[1 * 10 + 2], FOREGROUND);
        assert_eq!(mask[3 * 10 + 4], FOREGROUND);
        assert_eq!(mask[4 * 10 + 4], BACKGROUND);
        assert!(mask.iter().all(|&v| v == FOREGROUND || v == BACKGROUND));
    }

    #[test]
    fn test_rasterize_edges_are_half_open() {
        // edges on pixel centers 2.5 and 5.5: centers 2.5, 3.5 and 4.5 burn, 5.5 does not
        let mask = rasterize(&[square(2.5, 2.5, 3.0)], 10, 10);
        let on: usize = mask.iter().filter(|&&v| v == FOREGROUND).count();
        assert_eq!(on, 9);
        assert_eq!(mask[2 * 10 + 2], FOREGROUND);
        assert_eq!(mask[4 * 10 + 4], FOREGROUND);
        assert_eq!(mask[5 * 10 + 4], BACKGROUND);
        assert_eq!(mask[4 * 10 + 5], BACKGROUND);
    }

    #[test]
    fn test_rasterize_keeps_holes_empty() {
        let outer = square(0.0, 0.0, 6.0);
        let hole = square(2.0, 2.0, 2.0);
        let donut = Polygon::new(outer.exterior().clone(), vec![hole.exterior().clone()]);
        let mask = rasterize(&[donut], 6, 6);
        let on: usize = mask.iter().filter(|&&v| v == FOREGROUND).count();
        assert_eq!(on, 32);
        assert_eq!(mask[2 * 6 + 2], BACKGROUND);
    }

    #[test]
    fn test_rasterize_clips_to_extent() {
        let mask = rasterize(&[square(-5.0, -5.0, 7.0), square(50.0, 50.0, 3.0)], 4, 4);
        let on: usize = mask.iter().filter(|&&v| v == FOREGROUND).count();
        assert_eq!(on, 4);
    }

    #[test]
    fn test_polygon_to_pixels_round_trip() {
        let info = tile_info();
        let poly = square(2.3001, 48.8995, 0.0002);
        let pix = polygon_to_pixels(&info, &poly).unwrap();
        let back = info.transform.apply_polygon(&pix);
        for (a, b) in poly.exterior().coords().zip(back.exterior().coords()) {
            assert!((a.x - b.x).abs() < 1e-9);
            assert!((a.y - b.y).abs() < 1e-9);
        }
        let first = pix.exterior().0[0];
        assert!((first.x - 10.0).abs() < 1e-6);
        assert!((first.y - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_align_footprints_policies() {
        let mut info = tile_info();
        info.epsg = Some(32631);
        let footprints = Footprints {
            polygons: vec![square(2.3001, 48.8995, 0.0002)],
            epsg: Some(4326),
            wkt: String::new(),
        };

        assert!(align_footprints(&info, footprints.clone(), CrsPolicy::Fail).is_err());
        let kept = align_footprints(&info, footprints.clone(), CrsPolicy::Warn).unwrap();
        assert_eq!(kept, footprints.polygons);

        let empty = Footprints {
            polygons: vec![],
            ..footprints
        };
        assert!(align_footprints(&info, empty, CrsPolicy::Fail).unwrap().is_empty());
    }

    fn utm_tile() -> RasterInfo {
        // 0.3 m pixels anchored in UTM zone 31N
        RasterInfo {
            width: 650,
            height: 650,
            transform: GeoTransform::from_origin(448_000.0, 5_411_000.0, 0.3, 0.3),
            projection: String::new(),
            epsg: Some(32631),
        }
    }

    #[test]
    fn test_align_footprints_reprojects_to_raster_crs() {
        let info = utm_tile();
        // a 3 m building whose corner sits on pixel (100, 100)
        let utm_square = polygon![
            (x: 448_030.0, y: 5_410_970.0),
            (x: 448_033.0, y: 5_410_970.0),
            (x: 448_033.0, y: 5_410_967.0),
            (x: 448_030.0, y: 5_410_967.0),
            (x: 448_030.0, y: 5_410_970.0),
        ];
        let to_wgs84 = crs_proj(32631, 4326).unwrap();
        let footprints = Footprints {
            polygons: vec![transform_polygon(&to_wgs84, &utm_square).unwrap()],
            epsg: Some(4326),
            wkt: String::new(),
        };

        let aligned = align_footprints(&info, footprints, CrsPolicy::Reproject).unwrap();
        let pix = polygon_to_pixels(&info, &aligned[0]).unwrap();
        let ring = &pix.exterior().0;
        assert!((ring[0].x - 100.0).abs() < 1e-3, "{:?}", ring[0]);
        assert!((ring[0].y - 100.0).abs() < 1e-3, "{:?}", ring[0]);
        assert!((ring[2].x - 110.0).abs() < 1e-3, "{:?}", ring[2]);
        assert!((ring[2].y - 110.0).abs() < 1e-3, "{:?}", ring[2]);
    }

    #[test]
    fn test_align_footprints_without_vector_crs() {
        let mut info = utm_tile();
        info.projection = SpatialRef::from_epsg(32631).unwrap().to_wkt().unwrap();
        let footprints = Footprints {
            polygons: vec![square(448_030.0, 5_410_967.0, 3.0)],
            epsg: None,
            wkt: String::new(),
        };
        let aligned =
            align_footprints(&info, footprints.clone(), CrsPolicy::Reproject).unwrap();
        assert_eq!(aligned, footprints.polygons);
    }

    #[test]
    fn test_read_multipolygon_members_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi_buildings.geojson");
        let first = square(2.3001, 48.8995, 0.0002);
        let second = square(2.3005, 48.8993, 0.0001);
        let third = square(2.3007, 48.8991, 0.0001);
        let multi = geo::MultiPolygon(vec![first.clone(), second.clone()]);
        let features = vec![
            geojson::Feature::from(geojson::Geometry::new(geojson::Value::from(&multi))),
            geojson::Feature::from(geojson::Geometry::new(geojson::Value::from(&third))),
        ];
        let fc = geojson::FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        };
        std::fs::write(&path, GeoJson::from(fc).to_string()).unwrap();

        let footprints = Footprints::read(&path).unwrap();
        assert_eq!(footprints.polygons.len(), 3);
        let origins: Vec<(f64, f64)> = footprints
            .polygons
            .iter()
            .map(|p| (p.exterior().0[0].x, p.exterior().0[0].y))
            .collect();
        for (got, want) in origins.iter().zip([&first, &second, &third]) {
            assert!((got.0 - want.exterior().0[0].x).abs() < 1e-9);
            assert!((got.1 - want.exterior().0[0].y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_generate_mask_with_buildings() {
        let dir = tempfile::tempdir().unwrap();
        let tile = dir.path().join("img1.tif");
        let shapes = dir.path().join("img1_buildings.geojson");
        write_tile(&tile);
        write_footprints(
            &shapes,
            &[
                square(2.3001, 48.8995, 0.0002),
                square(2.3005, 48.8993, 0.0001),
            ],
        );

        let out = dir.path().join("mask");
        let generator = MaskGenerator::new(MaskConfig::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            out.clone(),
        ));
        assert_eq!(generator.footprint_path(&tile).unwrap(), shapes);

        let table = generator
            .generate_mask(&tile, &shapes, "img1_mask", PolygonTable::new())
            .unwrap();
        assert_eq!(table.len(), 2);
        let ids: Vec<usize> = table.records().iter().map(|r| r.building_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(table.records().iter().all(|r| r.image_id == "img1" && r.confidence == 1));
        assert!(table.records()[0].polygon_wkt_pix.starts_with("POLYGON(("));

        let png = image::open(out.join("img1_mask.png")).unwrap().to_luma8();
        assert_eq!(png.dimensions(), (100, 100));
        assert!(png.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
        assert!(png.pixels().any(|p| p.0[0] == 255));
    }

    #[test]
    fn test_generate_mask_missing_footprints() {
        let dir = tempfile::tempdir().unwrap();
        let tile = dir.path().join("img2.tif");
        write_tile(&tile);
        let out = dir.path().join("mask");
        let generator = MaskGenerator::new(MaskConfig::new(
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
            out.clone(),
        ));

        let mut seeded = PolygonTable::new();
        seeded.push_image("img0", &[square(1.0, 1.0, 2.0)]);
        let table = generator
            .generate_mask(&tile, &dir.path().join("img2_buildings.shp"), "img2_mask", seeded)
            .unwrap();
        assert_eq!(table.len(), 1);

        let png = image::open(out.join("img2_mask.png")).unwrap().to_luma8();
        assert!(png.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_run_writes_combined_table() {
        let dir = tempfile::tempdir().unwrap();
        let rasters = dir.path().join("tiles");
        let shapes = dir.path().join("shp");
        std::fs::create_dir_all(&rasters).unwrap();
        std::fs::create_dir_all(&shapes).unwrap();
        write_tile(&rasters.join("a.tif"));
        write_tile(&rasters.join("b.tif"));
        write_footprints(&shapes.join("a_buildings.geojson"), &[square(2.3001, 48.8995, 0.0002)]);
        std::fs::write(shapes.join("b_buildings.geojson"), b"").unwrap();

        let config = MaskConfig::new(rasters, shapes, dir.path().join("mask"));
        let csv_path = config.csv_path();
        let table = MaskGenerator::new(config).run().unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(PolygonTable::read_csv(&csv_path).unwrap(), table);
        assert!(dir.path().join("mask/a_mask.png").exists());
        assert!(dir.path().join("mask/b_mask.png").exists());
    }
}
