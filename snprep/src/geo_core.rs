use anyhow::{Context, Result};
use gdal::spatial_ref::SpatialRef;
use gdal::Dataset;
use geo::{coord, MapCoords, Polygon};
use proj::Proj;
use std::path::Path;

/// EPSG code of WGS84 longitude/latitude, the CRS of OSM data
pub const WGS84_EPSG: i32 = 4326;

const SINGULAR_EPSILON: f64 = 1e-15;

/// Affine transform between pixel (col, row) and map (x, y) coordinates.
///
/// Coefficients use the GDAL ordering `[x0, pixel_width, row_rotation, y0,
/// col_rotation, pixel_height]`, so `x = c0 + col * c1 + row * c2` and
/// `y = c3 + col * c4 + row * c5`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    coeffs: [f64; 6],
}

impl GeoTransform {
    pub fn new(coeffs: [f64; 6]) -> Self {
        GeoTransform { coeffs }
    }

    /// North-up transform with no rotation.
    /// `pixel_height` is the positive size of a pixel along y.
    pub fn from_origin(x0: f64, y0: f64, pixel_width: f64, pixel_height: f64) -> Self {
        GeoTransform::new([x0, pixel_width, 0.0, y0, 0.0, -pixel_height])
    }

    pub fn coeffs(&self) -> [f64; 6] {
        self.coeffs
    }

    /// Map a pixel position (col, row) to map coordinates
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let c = &self.coeffs;
        (
            c[0] + col * c[1] + row * c[2],
            c[3] + col * c[4] + row * c[5],
        )
    }

    /// Inverse transform (map -> pixel). Fails when the transform is singular.
    pub fn inverse(&self) -> Result<GeoTransform> {
        let c = &self.coeffs;
        let det = c[1] * c[5] - c[2] * c[4];
        if det.abs() < SINGULAR_EPSILON {
            anyhow::bail!("Geotransform {:?} is not invertible", c);
        }
        Ok(GeoTransform::new([
            (c[2] * c[3] - c[0] * c[5]) / det,
            c[5] / det,
            -c[2] / det,
            (c[0] * c[4] - c[1] * c[3]) / det,
            -c[4] / det,
            c[1] / det,
        ]))
    }

    /// Apply the transform to every vertex of a polygon, keeping vertex order
    pub fn apply_polygon(&self, polygon: &Polygon<f64>) -> Polygon<f64> {
        polygon.map_coords(|c| {
            let (x, y) = self.apply(c.x, c.y);
            coord! { x: x, y: y }
        })
    }

    /// Pixel size divided by `scale`, origin unchanged.
    /// Used when a raster is resampled by an integer factor.
    pub fn scaled(&self, scale: f64) -> GeoTransform {
        let c = &self.coeffs;
        GeoTransform::new([c[0], c[1] / scale, c[2] / scale, c[3], c[4] / scale, c[5] / scale])
    }
}

/// Georeferencing metadata of a raster on disk
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    /// Projection as WKT (may be empty when the raster carries no CRS)
    pub projection: String,
    /// EPSG code when GDAL can identify one
    pub epsg: Option<i32>,
}

impl RasterInfo {
    pub fn open(path: &Path) -> Result<Self> {
        let dataset =
            Dataset::open(path).with_context(|| format!("Failed to open raster: {:?}", path))?;
        Self::from_dataset(&dataset)
            .with_context(|| format!("Failed to read georeferencing of {:?}", path))
    }

    pub fn from_dataset(dataset: &Dataset) -> Result<Self> {
        let (width, height) = dataset.raster_size();
        let transform = dataset
            .geo_transform()
            .context("Raster has no geotransform")?;
        let epsg = dataset.spatial_ref().ok().and_then(epsg_of);

        Ok(RasterInfo {
            width: width as usize,
            height: height as usize,
            transform: GeoTransform::new(transform),
            projection: dataset.projection(),
            epsg,
        })
    }

    /// Extent of the raster in its own CRS
    /// Assumes a north-up raster, like the tiles it is used for
    pub fn extent(&self) -> BoundingBox {
        let c = self.transform.coeffs();
        let x_end = c[0] + self.width as f64 * c[1];
        let y_end = c[3] + self.height as f64 * c[5];
        BoundingBox::new(c[0].min(x_end), c[3].min(y_end), c[0].max(x_end), c[3].max(y_end))
    }
}

/// Best-effort EPSG identification of a spatial reference
pub fn epsg_of(mut srs: SpatialRef) -> Option<i32> {
    if let Ok(code) = srs.auth_code() {
        return Some(code);
    }
    srs.auto_identify_epsg().ok()?;
    srs.auth_code().ok()
}

/// Whether two CRS descriptions designate the same reference system.
/// EPSG codes win when both sides have one, otherwise GDAL compares the WKT.
pub fn same_crs(a_epsg: Option<i32>, a_wkt: &str, b_epsg: Option<i32>, b_wkt: &str) -> bool {
    if let (Some(a), Some(b)) = (a_epsg, b_epsg) {
        return a == b;
    }
    if a_wkt.is_empty() || b_wkt.is_empty() {
        return a_wkt.is_empty() && b_wkt.is_empty();
    }
    match (SpatialRef::from_wkt(a_wkt), SpatialRef::from_wkt(b_wkt)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a_wkt == b_wkt,
    }
}

/// Reproject every vertex of a polygon
pub fn transform_polygon(proj: &Proj, polygon: &Polygon<f64>) -> Result<Polygon<f64>> {
    polygon
        .try_map_coords(|c| {
            proj.convert((c.x, c.y))
                .map(|(x, y)| coord! { x: x, y: y })
        })
        .context("Failed to reproject polygon")
}

/// PROJ pipeline between two EPSG codes, with lon/lat axis order for geographic CRS
pub fn crs_proj(from_epsg: i32, to_epsg: i32) -> Result<Proj> {
    let from_crs = format!("EPSG:{}", from_epsg);
    let to_crs = format!("EPSG:{}", to_epsg);

    Proj::new_known_crs(&from_crs, &to_crs, None).with_context(|| {
        format!("Failed to create Proj transformation {} -> {}", from_crs, to_crs)
    })
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64, // min longitude
    pub min_y: f64, // min latitude
    pub max_x: f64, // max longitude
    pub max_y: f64, // max latitude
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Transform bounding box to another CRS.
    /// All four corners are projected so rotated grids still yield an enclosing box.
    pub fn transform(&self, from_epsg: i32, to_epsg: i32) -> Result<Self> {
        if from_epsg == to_epsg {
            return Ok(*self);
        }
        let proj = crs_proj(from_epsg, to_epsg)?;
        let corners = [
            (self.min_x, self.min_y),
            (self.min_x, self.max_y),
            (self.max_x, self.min_y),
            (self.max_x, self.max_y),
        ];

        let mut out = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for corner in corners {
            let (x, y) = proj
                .convert(corner)
                .context("Failed to transform bounding box corner")?;
            out.min_x = out.min_x.min(x);
            out.min_y = out.min_y.min(y);
            out.max_x = out.max_x.max(x);
            out.max_y = out.max_y.max(y);
        }
        Ok(out)
    }
}
