//! Truncation: removes every data point of a series while keeping the series
//! and its metamodel intact. Consumers get one truncation event each so they
//! can invalidate whatever they derived from the series.

use crate::{
    blob::BlobStorage,
    error::ServiceError,
    events::{ChangeEvent, ChangeEventType, EventSink},
    ident::quote_qualified,
    physical::{self, HistRelation},
    query_info::DataSeriesQueryInfo,
    repository::{consumers, data_points, file_lookups},
    types::VersionStamp,
};
use chrono::Utc;
use dataseries_entity::data_series;
use sea_orm::{ConnectionTrait, Statement};
use serde_json::json;

#[tracing::instrument(skip_all, fields(data_series_id = %series.id), err)]
pub async fn truncate_data_series<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
    info: &DataSeriesQueryInfo,
    blobs: &dyn BlobStorage,
    events: &dyn EventSink,
) -> Result<u64, ServiceError> {
    if series.locked {
        return Err(ServiceError::Locked);
    }
    let schema = &info.schema_name;
    let mut tables = Vec::new();
    if info.backend.has_wide_table() {
        tables.push(physical::mat_table_name(series.id));
    }
    if info.backend.has_flat_history() {
        tables.push(physical::flat_table_name(series.id));
    }
    if info.backend.has_fact_history() {
        for relation in HistRelation::ALL {
            tables.push(physical::hist_table_name(series.id, relation));
        }
        tables.push(physical::hist_del_table_name(series.id));
        tables.push(physical::hist_extra_table_name(series.id));
    }
    for table in tables {
        let sql = format!("DELETE FROM {}", quote_qualified(schema, &table));
        db.execute(Statement::from_string(db.get_database_backend(), sql))
            .await?;
    }

    let removed = data_points::delete_for_series(db, series.id).await?;
    for key in file_lookups::take_for_series(db, series.id).await? {
        blobs.delete(&key).await?;
    }

    let stamp = VersionStamp::new(Utc::now(), 0);
    for consumer in consumers::alive_for_series(db, series.id).await? {
        events
            .emit(ChangeEvent {
                tenant_id: series.tenant_id,
                data_series_id: series.id,
                event_type: ChangeEventType::DataSeriesTruncated,
                payload: json!({
                    "consumer_id": consumer.id,
                    "consumer_name": consumer.name,
                    "data_points_removed": removed,
                }),
                stamp,
            })
            .await;
    }
    Ok(removed)
}
