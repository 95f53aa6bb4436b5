pub mod bit_depth;
pub mod footprint;
pub mod mask;
#[cfg(feature = "superres")]
pub mod super_res;
