//! Deferred-batch execution. Large writes are staged inside the caller's
//! transaction and executed here after commit; a periodic sweep requeues
//! batches whose task never ran.

use crate::{
    accessor::DataPointAccessor,
    error::ServiceError,
    events::EventSink,
    modification::{self, ModificationContext},
    query_info::compute_data_series_query_info,
    repository::staged_batches,
    settings::EngineSettings,
    types::{NewDataPoint, VersionStamp},
};
use dataseries_entity::{data_series, sea_orm_active_enums::StagedBatchStatusType};
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use uuid::Uuid;

/// Executes one staged batch. Idempotent: anything but a pending batch is a
/// no-op, so redelivered task triggers are harmless.
#[tracing::instrument(skip(db, accessor, events, settings), err)]
pub async fn run_staged_batch(
    db: &DatabaseConnection,
    accessor: &dyn DataPointAccessor,
    events: &dyn EventSink,
    settings: &EngineSettings,
    staged_batch_id: Uuid,
) -> Result<(), ServiceError> {
    let batch = staged_batches::get(db, staged_batch_id).await?;
    if batch.status != StagedBatchStatusType::Pending {
        tracing::debug!(status = ?batch.status, "staged batch already settled");
        return Ok(());
    }
    let series = data_series::Entity::find_by_id(batch.data_series_id)
        .one(db)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("data series {}", batch.data_series_id))
        })?;
    let points: Vec<NewDataPoint> =
        serde_json::from_value(batch.payload.clone()).map_err(anyhow::Error::from)?;
    let info = compute_data_series_query_info(db, &series).await?;
    let ctx = ModificationContext {
        series: &series,
        info: &info,
        settings,
        accessor,
        events,
        stamp: VersionStamp::new(batch.point_in_time, batch.sub_clock),
    };

    let txn = db.begin().await?;
    let result = modification::create_data_points(&txn, &ctx, &points).await;
    match result {
        Ok(_) => {
            staged_batches::mark_done(&txn, batch).await?;
            txn.commit().await?;
            Ok(())
        }
        Err(ServiceError::Locked) => {
            // a migration holds the series; the stuck sweep retries later
            txn.rollback().await?;
            tracing::warn!("series locked, leaving batch pending");
            Ok(())
        }
        Err(err) => {
            txn.rollback().await?;
            staged_batches::mark_failed(db, batch, err.to_string()).await?;
            Err(err)
        }
    }
}

/// Requeues pending batches older than the stuck threshold. Covers crashes
/// between staging commit and task enqueue.
#[tracing::instrument(skip_all)]
pub async fn requeue_stuck(
    db: &DatabaseConnection,
    accessor: &dyn DataPointAccessor,
    events: &dyn EventSink,
    settings: &EngineSettings,
) -> Result<u64, ServiceError> {
    let stuck = staged_batches::list_stuck(db, settings.stuck_batch_after_secs).await?;
    let mut ran = 0u64;
    for batch in stuck {
        match run_staged_batch(db, accessor, events, settings, batch.id).await {
            Ok(()) => ran += 1,
            Err(err) => {
                tracing::error!(staged_batch_id = %batch.id, error = %err, "stuck batch failed");
            }
        }
    }
    Ok(ran)
}
