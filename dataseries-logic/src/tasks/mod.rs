//! Long-running maintenance operations. Each task is idempotent and safe to
//! re-run after a crash; callers schedule them from whatever job runner the
//! service embeds.

pub mod migrate;
pub mod nuke;
pub mod outbox;
pub mod prune;
pub mod truncate;

use crate::{
    physical,
    query_info::{DataSeriesQueryInfo, FieldTarget},
};
use sea_orm::{ConnectionTrait, DbErr};

/// Adds every fact/dimension column of the series to the given table.
/// Idempotent; used when a migration materializes a new table shape.
pub(crate) async fn ensure_field_columns<C: ConnectionTrait>(
    db: &C,
    info: &DataSeriesQueryInfo,
    table: &str,
) -> Result<(), DbErr> {
    for key in &info.data_point_serialization_keys {
        let sql_type = match key.target {
            FieldTarget::Fact(kind) => kind.sql_type(),
            FieldTarget::Dimension => "uuid",
        };
        physical::add_column(db, &info.schema_name, table, &key.column_name, sql_type).await?;
    }
    Ok(())
}
