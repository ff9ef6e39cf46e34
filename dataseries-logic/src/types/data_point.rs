use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Deterministic data point id. Repeated writes to the same external_id hit
/// the same identity, so writes upsert instead of duplicating.
pub fn data_point_id(data_series_id: Uuid, external_id: &str) -> Uuid {
    Uuid::new_v5(&data_series_id, external_id.as_bytes())
}

/// Version stamp of a write. `sub_clock` breaks ties between writes sharing
/// the same wall-clock millisecond within a tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionStamp {
    pub point_in_time: DateTime<Utc>,
    pub sub_clock: i64,
}

impl VersionStamp {
    pub fn new(point_in_time: DateTime<Utc>, sub_clock: i64) -> Self {
        Self {
            point_in_time,
            sub_clock,
        }
    }
}

/// One incoming record of a write batch: user-chosen external id plus a map
/// of fact/dimension external ids to JSON values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewDataPoint {
    pub external_id: String,
    pub payload: Map<String, JsonValue>,
}
