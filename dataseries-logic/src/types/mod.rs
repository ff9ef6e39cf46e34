pub mod backend;
pub mod data_point;
pub mod fact;

pub use backend::Backend;
pub use data_point::{data_point_id, NewDataPoint, VersionStamp};
pub use fact::{FactKind, FactValue};
