pub mod basic_functions;
pub mod polygon_table;
pub mod progress;
