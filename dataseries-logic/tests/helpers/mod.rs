use blockscout_service_launcher::test_database::TestDbGuard;
use chrono::{DateTime, Duration, TimeZone, Utc};
use dataseries_entity::data_series;
use dataseries_logic::{
    metamodel::{self, NewDataSeries},
    query_info::{compute_data_series_query_info, DataSeriesQueryInfo},
    types::{Backend, FactKind, NewDataPoint, VersionStamp},
};
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub async fn init_db(test_name: &str) -> TestDbGuard {
    TestDbGuard::new::<dataseries_migration::Migrator>(test_name).await
}

pub struct SeriesFixture {
    pub tenant_id: Uuid,
    pub series: data_series::Model,
    pub info: DataSeriesQueryInfo,
}

/// A series with the given fields attached, in a fresh tenant.
pub async fn setup_series(
    db: &DatabaseConnection,
    backend: Backend,
    fields: &[(&str, FactKind, bool)],
) -> SeriesFixture {
    let tenant_id = Uuid::new_v4();
    let series = metamodel::create_data_series(
        db,
        tenant_id,
        NewDataSeries {
            external_id: "measurements".to_string(),
            name: "Measurements".to_string(),
            backend,
            allow_extra_fields: false,
        },
    )
    .await
    .expect("create series");
    for (name, kind, optional) in fields {
        let fact = metamodel::create_fact(db, name.to_string(), *kind, *optional)
            .await
            .expect("create fact");
        metamodel::attach_fact(db, &series, fact.id, name.to_string())
            .await
            .expect("attach fact");
    }
    let info = compute_data_series_query_info(db, &series)
        .await
        .expect("query info");
    SeriesFixture {
        tenant_id,
        series,
        info,
    }
}

pub fn point(external_id: &str, payload: JsonValue) -> NewDataPoint {
    NewDataPoint {
        external_id: external_id.to_string(),
        payload: payload
            .as_object()
            .expect("payload must be an object")
            .clone(),
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// A stamp `secs` seconds past a fixed base instant.
pub fn stamp(secs: i64, sub_clock: i64) -> VersionStamp {
    VersionStamp::new(base_time() + Duration::seconds(secs), sub_clock)
}
