use crate::{error::ServiceError, types::data_point_id};
use dataseries_entity::data_points;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDataPoint {
    pub id: Uuid,
    pub data_series_id: Uuid,
    pub external_id: String,
}

/// How dimension reference identifiers are interpreted for one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveBy {
    ExternalId,
    CanonicalId,
}

/// Resolves a dimension reference without pulling in the whole storage stack.
/// Injected into the modification pipeline so validation stays decoupled.
#[async_trait::async_trait]
pub trait DataPointAccessor: Send + Sync {
    async fn resolve(
        &self,
        identifier: &str,
        data_series_id: Uuid,
    ) -> Result<Option<ResolvedDataPoint>, ServiceError>;
}

pub struct DbDataPointAccessor<'a> {
    db: &'a DatabaseConnection,
    resolve_by: ResolveBy,
}

impl<'a> DbDataPointAccessor<'a> {
    pub fn new(db: &'a DatabaseConnection, resolve_by: ResolveBy) -> Self {
        Self { db, resolve_by }
    }
}

#[async_trait::async_trait]
impl DataPointAccessor for DbDataPointAccessor<'_> {
    async fn resolve(
        &self,
        identifier: &str,
        data_series_id: Uuid,
    ) -> Result<Option<ResolvedDataPoint>, ServiceError> {
        let id = match self.resolve_by {
            ResolveBy::CanonicalId => identifier.parse::<Uuid>().ok(),
            ResolveBy::ExternalId => Some(data_point_id(data_series_id, identifier)),
        };
        let Some(id) = id else {
            return Ok(None);
        };
        let found = data_points::Entity::find_by_id(id)
            .filter(data_points::Column::DataSeriesId.eq(data_series_id))
            .one(self.db)
            .await?;
        Ok(found.map(|m| ResolvedDataPoint {
            id: m.id,
            data_series_id: m.data_series_id,
            external_id: m.external_id,
        }))
    }
}
