use crate::error::ValidationError;
use dataseries_entity::sea_orm_active_enums::BackendType;
use serde::{Deserialize, Serialize};

/// Active storage backend of a data series. Exactly one is active at a time;
/// only migration tasks change it, under lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    V1,
    Materialized,
    NoHistory,
    MaterializedFlatHistory,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::V1 => "v1",
            Backend::Materialized => "materialized",
            Backend::NoHistory => "no_history",
            Backend::MaterializedFlatHistory => "materialized_flat_history",
        }
    }

    /// Wide current-value table exists for every backend but V1.
    pub fn has_wide_table(&self) -> bool {
        !matches!(self, Backend::V1)
    }

    /// Column-per-fact historical relations.
    pub fn has_fact_history(&self) -> bool {
        matches!(self, Backend::V1 | Backend::Materialized)
    }

    pub fn has_flat_history(&self) -> bool {
        matches!(self, Backend::MaterializedFlatHistory)
    }

    pub fn keeps_history(&self) -> bool {
        self.has_fact_history() || self.has_flat_history()
    }

    /// The four legal one-way transitions. Everything else fails validation
    /// before any task is scheduled.
    pub fn validate_transition(self, target: Backend) -> Result<(), ValidationError> {
        let legal = matches!(
            (self, target),
            (Backend::V1, Backend::Materialized)
                | (Backend::Materialized, Backend::NoHistory)
                | (Backend::NoHistory, Backend::MaterializedFlatHistory)
                | (Backend::MaterializedFlatHistory, Backend::NoHistory)
        );
        if legal {
            Ok(())
        } else {
            Err(ValidationError::IllegalTransition {
                from: self,
                to: target,
            })
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<BackendType> for Backend {
    fn from(value: BackendType) -> Self {
        match value {
            BackendType::V1 => Backend::V1,
            BackendType::Materialized => Backend::Materialized,
            BackendType::NoHistory => Backend::NoHistory,
            BackendType::MaterializedFlatHistory => Backend::MaterializedFlatHistory,
        }
    }
}

impl From<Backend> for BackendType {
    fn from(value: Backend) -> Self {
        match value {
            Backend::V1 => BackendType::V1,
            Backend::Materialized => BackendType::Materialized,
            Backend::NoHistory => BackendType::NoHistory,
            Backend::MaterializedFlatHistory => BackendType::MaterializedFlatHistory,
        }
    }
}
