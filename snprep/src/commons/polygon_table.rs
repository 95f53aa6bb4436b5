use anyhow::{Context, Result};
use geo::Polygon;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Column names of the SpaceNet polygon table
pub const TABLE_HEADERS: [&str; 4] = ["ImageId", "BuildingId", "PolygonWKT_Pix", "Confidence"];

/// No scoring model exists upstream, every record is certain
pub const CONFIDENCE: u32 = 1;

/// One building of one image, in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolygonRecord {
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "BuildingId")]
    pub building_id: usize,
    #[serde(rename = "PolygonWKT_Pix")]
    pub polygon_wkt_pix: String,
    #[serde(rename = "Confidence")]
    pub confidence: u32,
}

/// Exterior ring as WKT with a constant zero z per vertex:
/// `POLYGON((x y 0, x y 0, ...))`.
/// Coordinates always carry a fractional part (`10.0`, never `10`).
pub fn polygon_wkt_z(polygon: &Polygon<f64>) -> String {
    let coords: Vec<String> = polygon
        .exterior()
        .coords()
        .map(|c| format!("{:?} {:?} 0", c.x, c.y))
        .collect();
    format!("POLYGON(({}))", coords.join(", "))
}

/// Polygon records accumulated across images.
///
/// Processing calls take the table by value and hand it back with their rows
/// appended; whoever owns it at the end writes it out once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolygonTable {
    records: Vec<PolygonRecord>,
}

impl PolygonTable {
    pub fn new() -> Self {
        PolygonTable::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PolygonRecord] {
        &self.records
    }

    /// Append one row per polygon, numbering buildings 1..N for this image
    pub fn push_image(&mut self, image_id: &str, polygons: &[Polygon<f64>]) {
        self.records
            .extend(polygons.iter().enumerate().map(|(idx, polygon)| PolygonRecord {
                image_id: image_id.to_string(),
                building_id: idx + 1,
                polygon_wkt_pix: polygon_wkt_z(polygon),
                confidence: CONFIDENCE,
            }));
    }

    /// Write the table as CSV; the header is written even for an empty table
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(writer);
        wtr.write_record(TABLE_HEADERS)
            .context("Failed to write CSV header")?;
        for record in &self.records {
            wtr.serialize(record)
                .context("Failed to write CSV record")?;
        }
        wtr.flush().context("Failed to flush CSV writer")?;
        Ok(())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
        }
        let file =
            File::create(path).with_context(|| format!("Failed to create CSV file: {:?}", path))?;
        self.to_writer(file)
            .with_context(|| format!("Failed to write polygon table to {:?}", path))
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open CSV file: {:?}", path))?;
        let records = rdr
            .deserialize()
            .collect::<std::result::Result<Vec<PolygonRecord>, _>>()
            .with_context(|| format!("Failed to parse polygon table {:?}", path))?;
        Ok(PolygonTable { records })
    }
}
