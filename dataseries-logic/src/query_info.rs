//! Compiles a data series' metamodel into an immutable description of its
//! physical layout. Every query-building component consumes this instead of
//! touching the metamodel tables itself. Compilation is one indexed read per
//! link table; callers issuing several queries in one transaction reuse the
//! same instance.

use crate::{
    error::ServiceError,
    ident::quote_qualified,
    physical,
    types::{Backend, FactKind},
};
use dataseries_entity::{data_series, data_series_facts, dimensions, facts};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FactColumnInfo {
    pub column_name: String,
    pub fact_id: Uuid,
    pub link_id: Uuid,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DimensionColumnInfo {
    pub column_name: String,
    pub link_id: Uuid,
    pub reference_data_series_id: Uuid,
    pub optional: bool,
}

/// What a payload key points at.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum FieldTarget {
    Fact(FactKind),
    Dimension,
}

/// One entry of the write-path projection: external id plus everything the
/// modification pipeline needs to write the field without re-querying the
/// metamodel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SerializationKey {
    pub external_id: String,
    pub link_id: Uuid,
    pub column_name: String,
    pub target: FieldTarget,
    pub reference_data_series_id: Option<Uuid>,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataSeriesQueryInfo {
    pub data_series_id: Uuid,
    pub tenant_id: Uuid,
    pub backend: Backend,
    pub allow_extra_fields: bool,
    pub schema_name: String,
    /// Quoted and schema-qualified; ready for interpolation.
    pub main_query_table: String,
    /// Predicate selecting live rows of the main table.
    pub alive_filter: String,
    pub facts: BTreeMap<FactKind, BTreeMap<String, FactColumnInfo>>,
    pub dimensions: BTreeMap<String, DimensionColumnInfo>,
    /// Extra columns the display builder must project (full-history variant).
    pub extra_query_fields: Vec<String>,
    pub data_point_serialization_keys: Vec<SerializationKey>,
}

impl DataSeriesQueryInfo {
    /// First match wins: fact-type maps in kind order, then dimensions.
    pub fn field(&self, external_id: &str) -> Option<SerializationKey> {
        for kind in FactKind::ALL {
            if let Some(info) = self.facts.get(&kind).and_then(|m| m.get(external_id)) {
                return Some(SerializationKey {
                    external_id: external_id.to_string(),
                    link_id: info.link_id,
                    column_name: info.column_name.clone(),
                    target: FieldTarget::Fact(kind),
                    reference_data_series_id: None,
                    optional: info.optional,
                });
            }
        }
        self.dimensions.get(external_id).map(|info| SerializationKey {
            external_id: external_id.to_string(),
            link_id: info.link_id,
            column_name: info.column_name.clone(),
            target: FieldTarget::Dimension,
            reference_data_series_id: Some(info.reference_data_series_id),
            optional: info.optional,
        })
    }

    pub fn fact_links_of_kind(&self, kind: FactKind) -> impl Iterator<Item = &FactColumnInfo> {
        self.facts.get(&kind).into_iter().flat_map(|m| m.values())
    }

    /// The same structure, retargeted at the flat-history table with the
    /// alive filter relaxed, so one row per *version* comes back.
    ///
    /// Only derivable for `MATERIALIZED_FLAT_HISTORY`; anything else is a
    /// caller bug, not user input.
    pub fn full_history(&self) -> Self {
        assert_eq!(
            self.backend,
            Backend::MaterializedFlatHistory,
            "full-history query info requested on backend {}",
            self.backend
        );
        let mut info = self.clone();
        info.main_query_table = quote_qualified(
            &self.schema_name,
            &physical::flat_table_name(self.data_series_id),
        );
        info.alive_filter = "1=1".to_string();
        info.extra_query_fields = vec!["sub_clock".to_string(), "deleted".to_string()];
        info
    }
}

pub async fn compute_data_series_query_info<C: ConnectionTrait>(
    db: &C,
    series: &data_series::Model,
) -> Result<DataSeriesQueryInfo, ServiceError> {
    let backend = Backend::from(series.backend);
    let schema_name = physical::tenant_schema(series.tenant_id);

    let fact_links = data_series_facts::Entity::find()
        .filter(data_series_facts::Column::DataSeriesId.eq(series.id))
        .filter(data_series_facts::Column::DeletedAt.is_null())
        .find_also_related(facts::Entity)
        .all(db)
        .await?;

    let mut fact_maps: BTreeMap<FactKind, BTreeMap<String, FactColumnInfo>> = BTreeMap::new();
    for (link, fact) in fact_links {
        let fact = fact.ok_or_else(|| {
            ServiceError::NotFound(format!("fact {} of link {}", link.fact_id, link.id))
        })?;
        fact_maps
            .entry(FactKind::from(fact.kind))
            .or_default()
            .insert(
                link.external_id.clone(),
                FactColumnInfo {
                    column_name: link.column_name,
                    fact_id: link.fact_id,
                    link_id: link.id,
                    optional: fact.optional,
                },
            );
    }

    let dimension_links = dimensions::Entity::find()
        .filter(dimensions::Column::DataSeriesId.eq(series.id))
        .filter(dimensions::Column::DeletedAt.is_null())
        .all(db)
        .await?;

    let mut dimension_map = BTreeMap::new();
    for link in dimension_links {
        dimension_map.insert(
            link.external_id.clone(),
            DimensionColumnInfo {
                column_name: link.column_name,
                link_id: link.id,
                reference_data_series_id: link.reference_data_series_id,
                optional: link.optional,
            },
        );
    }

    let (main_query_table, alive_filter) = if backend.has_wide_table() {
        (
            quote_qualified(&schema_name, &physical::mat_table_name(series.id)),
            "\"deleted_at\" IS NULL".to_string(),
        )
    } else {
        // V1 has no wide table; the identity registry is the anchor and
        // liveness comes from tombstone versions at query time.
        ("\"data_points\"".to_string(), "1=1".to_string())
    };

    let mut info = DataSeriesQueryInfo {
        data_series_id: series.id,
        tenant_id: series.tenant_id,
        backend,
        allow_extra_fields: series.allow_extra_fields,
        schema_name,
        main_query_table,
        alive_filter,
        facts: fact_maps,
        dimensions: dimension_map,
        extra_query_fields: vec![],
        data_point_serialization_keys: vec![],
    };
    info.data_point_serialization_keys = serialization_keys(&info);
    Ok(info)
}

fn serialization_keys(info: &DataSeriesQueryInfo) -> Vec<SerializationKey> {
    let mut keys: Vec<SerializationKey> = info
        .facts
        .values()
        .flat_map(|m| m.keys())
        .chain(info.dimensions.keys())
        .filter_map(|external_id| info.field(external_id))
        .collect();
    keys.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(backend: Backend) -> DataSeriesQueryInfo {
        let ds = Uuid::new_v4();
        let link = Uuid::new_v4();
        let mut facts = BTreeMap::new();
        facts.insert(
            FactKind::Float,
            BTreeMap::from([(
                "height".to_string(),
                FactColumnInfo {
                    column_name: physical::fact_column_name(link, "height"),
                    fact_id: Uuid::new_v4(),
                    link_id: link,
                    optional: false,
                },
            )]),
        );
        let mut info = DataSeriesQueryInfo {
            data_series_id: ds,
            tenant_id: Uuid::new_v4(),
            backend,
            allow_extra_fields: false,
            schema_name: "ds_t_x".to_string(),
            main_query_table: quote_qualified("ds_t_x", &physical::mat_table_name(ds)),
            alive_filter: "\"deleted_at\" IS NULL".to_string(),
            facts,
            dimensions: BTreeMap::new(),
            extra_query_fields: vec![],
            data_point_serialization_keys: vec![],
        };
        info.data_point_serialization_keys = serialization_keys(&info);
        info
    }

    #[test]
    fn field_dispatch_finds_fact() {
        let info = sample_info(Backend::Materialized);
        let key = info.field("height").unwrap();
        assert_eq!(key.target, FieldTarget::Fact(FactKind::Float));
        assert!(info.field("unknown").is_none());
    }

    #[test]
    fn full_history_retargets_flat_table() {
        let info = sample_info(Backend::MaterializedFlatHistory);
        let full = info.full_history();
        assert!(full.main_query_table.contains("__flat"));
        assert_eq!(full.alive_filter, "1=1");
        assert_eq!(full.extra_query_fields, vec!["sub_clock", "deleted"]);
    }

    #[test]
    #[should_panic(expected = "full-history query info requested")]
    fn full_history_panics_on_other_backends() {
        sample_info(Backend::Materialized).full_history();
    }
}
