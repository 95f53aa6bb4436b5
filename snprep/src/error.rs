use thiserror::Error;

/// Failures of an Overpass query
#[derive(Debug, Error)]
pub enum OverpassError {
    #[error("Overpass gateway timeout (HTTP 504)")]
    GatewayTimeout,
    #[error("Overpass rate limit reached (HTTP 429)")]
    TooManyRequests,
    #[error("Overpass rejected the query (HTTP 400): {0}")]
    BadRequest(String),
    #[error("Overpass returned HTTP {status}: {body}")]
    UnknownStatus { status: u16, body: String },
    #[error("Overpass runtime error: {0}")]
    Runtime(String),
    #[error("Failed to reach Overpass API: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Failed to decode Overpass response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl OverpassError {
    /// Errors reported by the API itself are worth another attempt;
    /// transport and decoding failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OverpassError::GatewayTimeout
                | OverpassError::TooManyRequests
                | OverpassError::BadRequest(_)
                | OverpassError::UnknownStatus { .. }
                | OverpassError::Runtime(_)
        )
    }
}

/// Raster and footprint layer disagree on their reference system
#[derive(Debug, Error)]
#[error("CRS mismatch: raster is {raster}, footprints are {vector}; convert vector and raster to the same CRS")]
pub struct CrsMismatch {
    pub raster: String,
    pub vector: String,
}
