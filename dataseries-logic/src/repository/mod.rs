pub mod consumers;
pub mod data_points;
pub mod data_series;
pub mod file_lookups;
pub mod staged_batches;
