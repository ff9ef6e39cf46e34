mod helpers;

use chrono::{Duration, Utc};
use dataseries_logic::{
    accessor::{DbDataPointAccessor, ResolveBy},
    blob::NullBlobStorage,
    display::{query_data_points, DisplayParams},
    error::{ServiceError, ValidationError},
    events::{ChangeEventType, NullEventSink, RecordingEventSink},
    metamodel,
    modification::{self, BulkOutcome, ModificationContext},
    query_info::compute_data_series_query_info,
    repository::data_series as data_series_repo,
    settings::EngineSettings,
    tasks::{migrate, nuke, outbox, prune, truncate},
    types::{Backend, FactKind},
};
use helpers::{base_time, point, setup_series, stamp};
use pretty_assertions::assert_eq;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;

fn default_fields() -> Vec<(&'static str, FactKind, bool)> {
    vec![
        ("height", FactKind::Float, false),
        ("label", FactKind::String, true),
    ]
}

fn params(page_size: u64) -> DisplayParams {
    DisplayParams {
        page_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn v1_to_materialized_migration_preserves_points() {
    let db = helpers::init_db("task_migrate_v1").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::V1, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings::default();

    let ctx = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    let batch: Vec<_> = (0..5)
        .map(|i| point(&format!("p{i}"), json!({ "height": i as f64, "label": "x" })))
        .collect();
    modification::create_data_points(client.as_ref(), &ctx, &batch)
        .await
        .unwrap();

    migrate::run_backend_migration(
        client.as_ref(),
        fixture.tenant_id,
        fixture.series.id,
        Backend::Materialized,
        true,
    )
    .await
    .unwrap();

    let series = data_series_repo::get_alive(client.as_ref(), fixture.tenant_id, fixture.series.id)
        .await
        .unwrap();
    assert_eq!(Backend::from(series.backend), Backend::Materialized);
    assert!(!series.locked);

    let info = compute_data_series_query_info(client.as_ref(), &series)
        .await
        .unwrap();
    let page = query_data_points(client.as_ref(), &info, &params(10))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 5);
    let p3 = page.items.iter().find(|i| i.external_id == "p3").unwrap();
    assert_eq!(p3.payload["height"], json!(3.0));
}

#[tokio::test]
async fn illegal_transition_is_rejected_without_side_effects() {
    let db = helpers::init_db("task_migrate_illegal").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::V1, &default_fields()).await;

    let err = migrate::run_backend_migration(
        client.as_ref(),
        fixture.tenant_id,
        fixture.series.id,
        Backend::NoHistory,
        true,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::IllegalTransition { .. })
    ));

    let series = data_series_repo::get_alive(client.as_ref(), fixture.tenant_id, fixture.series.id)
        .await
        .unwrap();
    assert_eq!(Backend::from(series.backend), Backend::V1);
    assert!(!series.locked);
}

#[tokio::test]
async fn migration_without_accept_only_plans() {
    let db = helpers::init_db("task_migrate_dry_run").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::V1, &default_fields()).await;

    let err = migrate::run_backend_migration(
        client.as_ref(),
        fixture.tenant_id,
        fixture.series.id,
        Backend::Materialized,
        false,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::NotAccepted)
    ));
    let series = data_series_repo::get_alive(client.as_ref(), fixture.tenant_id, fixture.series.id)
        .await
        .unwrap();
    assert!(!series.locked);
}

#[tokio::test]
async fn prune_drops_superseded_versions_but_keeps_live_state() {
    let db = helpers::init_db("task_prune").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings::default();
    let blobs = NullBlobStorage;

    let first = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    modification::create_data_points(
        client.as_ref(),
        &first,
        &[point("p1", json!({ "height": 1.0, "label": "old" }))],
    )
    .await
    .unwrap();
    let second = ModificationContext {
        stamp: stamp(60, 0),
        ..first
    };
    modification::create_data_points(
        client.as_ref(),
        &second,
        &[point("p1", json!({ "height": 2.0, "label": "new" }))],
    )
    .await
    .unwrap();

    let cutoff = base_time() + Duration::seconds(120);
    let report = prune::prune_history(client.as_ref(), &fixture.info, &blobs, cutoff)
        .await
        .unwrap();
    assert!(report.history_rows_removed > 0);

    let page = query_data_points(client.as_ref(), &fixture.info, &params(10))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].payload["height"], json!(2.0));

    // a second pass finds nothing more to remove
    let report = prune::prune_history(client.as_ref(), &fixture.info, &blobs, cutoff)
        .await
        .unwrap();
    assert_eq!(report.history_rows_removed, 0);
}

#[tokio::test]
async fn prune_removes_tombstoned_materialized_rows() {
    let db = helpers::init_db("task_prune_tombstones").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings::default();
    let blobs = NullBlobStorage;

    let ctx = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    modification::create_data_points(
        client.as_ref(),
        &ctx,
        &[
            point("p1", json!({ "height": 1.0 })),
            point("p2", json!({ "height": 2.0 })),
        ],
    )
    .await
    .unwrap();
    let delete_ctx = ModificationContext {
        stamp: stamp(10, 0),
        ..ctx
    };
    modification::delete_data_point(client.as_ref(), &delete_ctx, "p1")
        .await
        .unwrap();

    let with_deleted = DisplayParams {
        include_deleted: true,
        ..params(10)
    };
    let page = query_data_points(client.as_ref(), &fixture.info, &with_deleted)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);

    let cutoff = base_time() + Duration::seconds(120);
    let report = prune::prune_history(client.as_ref(), &fixture.info, &blobs, cutoff)
        .await
        .unwrap();
    assert_eq!(report.tombstoned_rows_removed, 1);

    let page = query_data_points(client.as_ref(), &fixture.info, &with_deleted)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].external_id, "p2");
}

#[tokio::test]
async fn prune_metamodel_reclaims_consumers_and_indexes() {
    let db = helpers::init_db("task_prune_metamodel").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;

    let consumer = metamodel::add_consumer(
        client.as_ref(),
        &fixture.series,
        "warehouse".to_string(),
        "https://example.com/hooks/warehouse".to_string(),
    )
    .await
    .unwrap();
    metamodel::remove_consumer(client.as_ref(), consumer).await.unwrap();

    let index = metamodel::create_user_index(
        client.as_ref(),
        &fixture.series,
        &fixture.info,
        "by_height".to_string(),
        vec!["height".to_string()],
    )
    .await
    .unwrap();
    metamodel::drop_user_index(client.as_ref(), &fixture.series, index)
        .await
        .unwrap();

    let blobs = NullBlobStorage;
    let cutoff = Utc::now() + Duration::seconds(60);
    let reclaimed = prune::prune_metamodel(
        client.as_ref(),
        &fixture.series,
        &fixture.info,
        &blobs,
        cutoff,
    )
    .await
    .unwrap();
    assert_eq!(reclaimed, 2);

    let consumers = dataseries_entity::consumers::Entity::find()
        .filter(dataseries_entity::consumers::Column::DataSeriesId.eq(fixture.series.id))
        .all(client.as_ref())
        .await
        .unwrap();
    assert!(consumers.is_empty());
    let indexes = dataseries_entity::user_indexes::Entity::find()
        .filter(dataseries_entity::user_indexes::Column::DataSeriesId.eq(fixture.series.id))
        .all(client.as_ref())
        .await
        .unwrap();
    assert!(indexes.is_empty());
}

#[tokio::test]
async fn truncate_notifies_each_consumer() {
    let db = helpers::init_db("task_truncate").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings::default();
    let blobs = NullBlobStorage;

    metamodel::add_consumer(
        client.as_ref(),
        &fixture.series,
        "warehouse".to_string(),
        "https://example.com/hooks/warehouse".to_string(),
    )
    .await
    .unwrap();
    metamodel::add_consumer(
        client.as_ref(),
        &fixture.series,
        "cache".to_string(),
        "https://example.com/hooks/cache".to_string(),
    )
    .await
    .unwrap();

    let ctx = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    modification::create_data_points(
        client.as_ref(),
        &ctx,
        &[
            point("p1", json!({ "height": 1.0 })),
            point("p2", json!({ "height": 2.0 })),
        ],
    )
    .await
    .unwrap();

    let sink = RecordingEventSink::default();
    let removed = truncate::truncate_data_series(
        client.as_ref(),
        &fixture.series,
        &fixture.info,
        &blobs,
        &sink,
    )
    .await
    .unwrap();
    assert_eq!(removed, 2);

    let emitted = sink.take().await;
    assert_eq!(emitted.len(), 2);
    assert!(emitted
        .iter()
        .all(|e| e.event_type == ChangeEventType::DataSeriesTruncated));

    let page = query_data_points(client.as_ref(), &fixture.info, &params(10))
        .await
        .unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
async fn nuke_requires_soft_delete_first() {
    let db = helpers::init_db("task_nuke").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let blobs = NullBlobStorage;

    let err = nuke::nuke_data_series(
        client.as_ref(),
        fixture.tenant_id,
        fixture.series.id,
        &blobs,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    metamodel::soft_delete_data_series(client.as_ref(), fixture.series.clone())
        .await
        .unwrap();
    nuke::nuke_data_series(
        client.as_ref(),
        fixture.tenant_id,
        fixture.series.id,
        &blobs,
    )
    .await
    .unwrap();

    let err = data_series_repo::get_any(client.as_ref(), fixture.tenant_id, fixture.series.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn staged_batch_runs_through_outbox() {
    let db = helpers::init_db("task_outbox").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings {
        defer_threshold: 2,
        ..Default::default()
    };

    let ctx = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    let batch: Vec<_> = (0..4)
        .map(|i| point(&format!("p{i}"), json!({ "height": i as f64 })))
        .collect();
    let outcome = modification::create_bulk_or_stage(client.as_ref(), &ctx, &batch)
        .await
        .unwrap();
    let BulkOutcome::Staged { staged_batch_id } = outcome else {
        panic!("expected the batch to be staged");
    };

    // nothing is visible until the outbox task runs
    let page = query_data_points(client.as_ref(), &fixture.info, &params(10))
        .await
        .unwrap();
    assert!(page.items.is_empty());

    outbox::run_staged_batch(client.as_ref(), &accessor, &events, &settings, staged_batch_id)
        .await
        .unwrap();
    let page = query_data_points(client.as_ref(), &fixture.info, &params(10))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 4);

    // re-running the settled batch is a no-op
    outbox::run_staged_batch(client.as_ref(), &accessor, &events, &settings, staged_batch_id)
        .await
        .unwrap();
    let page = query_data_points(client.as_ref(), &fixture.info, &params(10))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 4);
}

#[tokio::test]
async fn small_bulk_writes_synchronously() {
    let db = helpers::init_db("task_bulk_sync").await;
    let client = db.client();
    let fixture = setup_series(client.as_ref(), Backend::Materialized, &default_fields()).await;
    let accessor = DbDataPointAccessor::new(client.as_ref(), ResolveBy::ExternalId);
    let events = NullEventSink;
    let settings = EngineSettings::default();

    let ctx = ModificationContext {
        series: &fixture.series,
        info: &fixture.info,
        settings: &settings,
        accessor: &accessor,
        events: &events,
        stamp: stamp(0, 0),
    };
    let outcome = modification::create_bulk_or_stage(
        client.as_ref(),
        &ctx,
        &[point("p1", json!({ "height": 1.0 }))],
    )
    .await
    .unwrap();
    assert!(matches!(outcome, BulkOutcome::Written { ref ids } if ids.len() == 1));

    let oversized: Vec<_> = (0..settings.max_bulk_size + 1)
        .map(|i| point(&format!("p{i}"), json!({ "height": 1.0 })))
        .collect();
    let err = modification::create_bulk_or_stage(client.as_ref(), &ctx, &oversized)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Validation(ValidationError::BatchTooLarge { .. })
    ));
}
