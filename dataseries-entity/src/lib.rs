pub mod consumers;
pub mod data_points;
pub mod data_series;
pub mod data_series_facts;
pub mod dimensions;
pub mod facts;
pub mod file_lookups;
pub mod sea_orm_active_enums;
pub mod staged_batches;
pub mod user_indexes;
