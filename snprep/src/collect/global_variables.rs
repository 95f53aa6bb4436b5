/// Public Overpass API instance
pub const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Per-request timeout for Overpass queries, in seconds
pub const OVERPASS_TIMEOUT_SECS: u64 = 180;

/// Retry schedule for transient Overpass errors (2 s, then 4 s)
pub const OVERPASS_TRIES: u32 = 3;
pub const OVERPASS_DELAY_SECS: u64 = 2;
pub const OVERPASS_BACKOFF: u32 = 2;

/// Suffix appended to a tile stem to name its footprint files
pub const BUILDINGS_SUFFIX: &str = "_buildings";

/// Suffix appended to a tile stem to name its mask, stripped again for `ImageId`
pub const MASK_SUFFIX: &str = "_mask";

pub const COMBINED_CSV_NAME: &str = "full_gt_masks_fixed.csv";

pub const EIGHT_BIT_SUFFIX: &str = "_8bit";
pub const UPSAMPLED_SUFFIX: &str = "_upsampled";

/// Default percentile window for the 8-bit stretch
pub const STRETCH_LOW_PERCENTILE: f64 = 2.0;
pub const STRETCH_HIGH_PERCENTILE: f64 = 98.0;

pub const SUPERRES_ALGORITHM: &str = "edsr";
pub const SUPERRES_SCALE: i32 = 2;
