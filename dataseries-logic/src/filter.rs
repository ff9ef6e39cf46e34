//! Compiles user-defined filter trees into parameterized SQL fragments.
//!
//! Grammar: `{"$and": [..]}`, `{"$or": [..]}`, or `{field: value}` where the
//! value is either a bare value (shorthand for `$eq`) or an operator map.
//! An object with several keys is an implicit `$and` over its entries, and so
//! is an operator map with several operators (`{"$gte": 1, "$lt": 2}`).

use crate::{
    error::ValidationError,
    query_info::{DataSeriesQueryInfo, FieldTarget, SerializationKey},
    types::{data_point_id, FactKind, FactValue},
};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use uuid::Uuid;

pub const DEFAULT_MAX_DEPTH: usize = 10;

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Field { field: String, predicate: Predicate },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Eq(JsonValue),
    Ne(JsonValue),
    Lt(JsonValue),
    Lte(JsonValue),
    Gt(JsonValue),
    Gte(JsonValue),
    In(Vec<JsonValue>),
    Nin(Vec<JsonValue>),
    Prefix(String),
}

impl Filter {
    pub fn parse(value: &JsonValue, max_depth: usize) -> Result<Filter, ValidationError> {
        parse_filter(value, max_depth, 0)
    }
}

fn parse_filter(
    value: &JsonValue,
    max_depth: usize,
    depth: usize,
) -> Result<Filter, ValidationError> {
    if depth >= max_depth {
        return Err(ValidationError::FilterTooDeep(max_depth));
    }
    let obj = value
        .as_object()
        .ok_or_else(|| ValidationError::InvalidFilter("filter must be an object".into()))?;

    let mut parts = Vec::with_capacity(obj.len());
    for (key, val) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let items = val.as_array().ok_or_else(|| {
                    ValidationError::InvalidFilter(format!("{key} expects an array"))
                })?;
                let children = items
                    .iter()
                    .map(|item| parse_filter(item, max_depth, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                parts.push(if key == "$and" {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                });
            }
            field if field.starts_with('$') => {
                return Err(ValidationError::InvalidFilter(format!(
                    "unknown operator '{field}'"
                )));
            }
            field => {
                let mut fields: Vec<Filter> = parse_predicates(field, val)?
                    .into_iter()
                    .map(|predicate| Filter::Field {
                        field: field.to_string(),
                        predicate,
                    })
                    .collect();
                parts.push(match fields.len() {
                    1 => fields.pop().expect("checked length"),
                    _ => Filter::And(fields),
                });
            }
        }
    }
    Ok(match parts.len() {
        1 => parts.pop().expect("checked length"),
        _ => Filter::And(parts),
    })
}

/// An operator map yields one predicate per operator; the caller joins them
/// with `$and`. A map mixing operators with plain keys is rejected.
fn parse_predicates(field: &str, value: &JsonValue) -> Result<Vec<Predicate>, ValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(vec![Predicate::Eq(value.clone())]);
    };
    if !obj.keys().any(|k| k.starts_with('$')) {
        // a plain json object compared as a value
        return Ok(vec![Predicate::Eq(value.clone())]);
    }
    obj.iter()
        .map(|(op, val)| parse_operator(field, op, val))
        .collect()
}

fn parse_operator(
    field: &str,
    op: &str,
    val: &JsonValue,
) -> Result<Predicate, ValidationError> {
    let list = |val: &JsonValue| -> Result<Vec<JsonValue>, ValidationError> {
        val.as_array().cloned().ok_or_else(|| {
            ValidationError::InvalidFilter(format!("'{op}' on '{field}' expects an array"))
        })
    };
    match op {
        "$eq" => Ok(Predicate::Eq(val.clone())),
        "$ne" => Ok(Predicate::Ne(val.clone())),
        "$lt" => Ok(Predicate::Lt(val.clone())),
        "$lte" => Ok(Predicate::Lte(val.clone())),
        "$gt" => Ok(Predicate::Gt(val.clone())),
        "$gte" => Ok(Predicate::Gte(val.clone())),
        "$in" => Ok(Predicate::In(list(val)?)),
        "$nin" => Ok(Predicate::Nin(list(val)?)),
        "$prefix" => val
            .as_str()
            .map(|s| Predicate::Prefix(s.to_string()))
            .ok_or_else(|| ValidationError::InvalidFilter(format!(
                "'$prefix' on '{field}' expects a string"
            ))),
        other => Err(ValidationError::InvalidFilter(format!(
            "unknown operator '{other}' on field '{field}'"
        ))),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<sea_orm::Value>,
    /// Physical columns the fragment references; the caller adds the
    /// corresponding joins/projections.
    pub referenced_columns: BTreeSet<String>,
}

/// Compiles a filter against a data series layout. `use_materialized` selects
/// wide-table column references (`t."col"`) versus per-fact version aliases
/// (`v_col."value"`) for the history path. Parameter placeholders continue
/// from `param_offset`.
pub fn compile_filter(
    filter: &Filter,
    info: &DataSeriesQueryInfo,
    use_materialized: bool,
    param_offset: usize,
) -> Result<CompiledFilter, ValidationError> {
    let mut compiler = Compiler {
        info,
        use_materialized,
        param_offset,
        params: vec![],
        referenced_columns: BTreeSet::new(),
        unknown_fields: BTreeSet::new(),
    };
    let sql = compiler.compile(filter)?;
    if !compiler.unknown_fields.is_empty() {
        return Err(ValidationError::UnknownFields(
            compiler.unknown_fields.into_iter().collect(),
        ));
    }
    Ok(CompiledFilter {
        sql,
        params: compiler.params,
        referenced_columns: compiler.referenced_columns,
    })
}

/// Alias of the per-column version join in the history query path. Truncated
/// so the alias stays inside the identifier limit; the hash prefix of the
/// column name keeps truncated aliases unique.
pub fn version_alias(column_name: &str) -> String {
    let mut alias = format!("v_{column_name}");
    alias.truncate(63);
    alias
}

struct Compiler<'a> {
    info: &'a DataSeriesQueryInfo,
    use_materialized: bool,
    param_offset: usize,
    params: Vec<sea_orm::Value>,
    referenced_columns: BTreeSet<String>,
    unknown_fields: BTreeSet<String>,
}

impl Compiler<'_> {
    fn compile(&mut self, filter: &Filter) -> Result<String, ValidationError> {
        match filter {
            Filter::And(children) if children.is_empty() => Ok("1=1".to_string()),
            Filter::Or(children) if children.is_empty() => Ok("1=0".to_string()),
            Filter::And(children) | Filter::Or(children) => {
                let sep = if matches!(filter, Filter::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts = children
                    .iter()
                    .map(|child| self.compile(child))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", parts.join(sep)))
            }
            Filter::Field { field, predicate } => self.compile_field(field, predicate),
        }
    }

    fn compile_field(
        &mut self,
        field: &str,
        predicate: &Predicate,
    ) -> Result<String, ValidationError> {
        let Some(key) = self.info.field(field) else {
            // keep walking so every unrecognized field is reported together
            self.unknown_fields.insert(field.to_string());
            return Ok("1=1".to_string());
        };
        self.referenced_columns.insert(key.column_name.clone());
        let column = self.column_expr(&key);

        match predicate {
            Predicate::Eq(value) if value.is_null() => Ok(format!("{column} IS NULL")),
            Predicate::Ne(value) if value.is_null() => Ok(format!("{column} IS NOT NULL")),
            Predicate::Eq(value) => {
                let p = self.bind(&key, field, value)?;
                Ok(format!("{column} = {p}"))
            }
            Predicate::Ne(value) => {
                let p = self.bind(&key, field, value)?;
                Ok(format!("{column} <> {p}"))
            }
            Predicate::Lt(value)
            | Predicate::Lte(value)
            | Predicate::Gt(value)
            | Predicate::Gte(value) => {
                self.check_orderable(&key, field)?;
                if value.is_null() {
                    return Err(ValidationError::InvalidValue {
                        field: field.to_string(),
                        message: "null cannot be compared with an ordering operator".into(),
                    });
                }
                let op = match predicate {
                    Predicate::Lt(_) => "<",
                    Predicate::Lte(_) => "<=",
                    Predicate::Gt(_) => ">",
                    Predicate::Gte(_) => ">=",
                    _ => unreachable!(),
                };
                let p = self.bind(&key, field, value)?;
                Ok(format!("{column} {op} {p}"))
            }
            Predicate::In(values) | Predicate::Nin(values) => {
                let negated = matches!(predicate, Predicate::Nin(_));
                if values.is_empty() {
                    return Ok(if negated { "1=1" } else { "1=0" }.to_string());
                }
                let placeholders = values
                    .iter()
                    .map(|value| {
                        if value.is_null() {
                            return Err(ValidationError::InvalidValue {
                                field: field.to_string(),
                                message: "null is not allowed in $in/$nin lists".into(),
                            });
                        }
                        self.bind(&key, field, value)
                    })
                    .collect::<Result<Vec<_>, _>>()?
                    .join(", ");
                let op = if negated { "NOT IN" } else { "IN" };
                Ok(format!("{column} {op} ({placeholders})"))
            }
            Predicate::Prefix(prefix) => {
                match key.target {
                    FieldTarget::Fact(FactKind::String) | FieldTarget::Fact(FactKind::Text) => {}
                    _ => {
                        return Err(ValidationError::WrongType {
                            field: field.to_string(),
                            expected: "a string fact for $prefix",
                        })
                    }
                }
                let escaped = prefix
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                let p = self.push_param(format!("{escaped}%").into());
                Ok(format!("{column} LIKE {p}"))
            }
        }
    }

    fn column_expr(&self, key: &SerializationKey) -> String {
        let base = if self.use_materialized {
            format!("t.\"{}\"", key.column_name)
        } else {
            format!("{}.\"value\"", version_alias(&key.column_name))
        };
        match key.target {
            FieldTarget::Fact(FactKind::Float) => format!("({base})::double precision"),
            _ => base,
        }
    }

    fn check_orderable(
        &self,
        key: &SerializationKey,
        field: &str,
    ) -> Result<(), ValidationError> {
        match key.target {
            FieldTarget::Fact(FactKind::Json) | FieldTarget::Fact(FactKind::Boolean) => {
                Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "this fact type cannot be compared with ordering operators".into(),
                })
            }
            FieldTarget::Dimension => Err(ValidationError::InvalidValue {
                field: field.to_string(),
                message: "dimensions only support equality and membership operators".into(),
            }),
            FieldTarget::Fact(_) => Ok(()),
        }
    }

    /// Validates the value against the field's type and binds it, returning
    /// the placeholder.
    fn bind(
        &mut self,
        key: &SerializationKey,
        field: &str,
        value: &JsonValue,
    ) -> Result<String, ValidationError> {
        let bound: sea_orm::Value = match key.target {
            FieldTarget::Fact(kind) => FactValue::parse(kind, field, value)?
                .expect("null handled by callers")
                .to_sea_value(),
            FieldTarget::Dimension => {
                let raw = value.as_str().ok_or(ValidationError::WrongType {
                    field: field.to_string(),
                    expected: "a data point identifier",
                })?;
                let reference = key
                    .reference_data_series_id
                    .expect("dimension keys always carry a reference");
                let id = raw
                    .parse::<Uuid>()
                    .unwrap_or_else(|_| data_point_id(reference, raw));
                id.into()
            }
        };
        Ok(self.push_param(bound))
    }

    fn push_param(&mut self, value: sea_orm::Value) -> String {
        self.params.push(value);
        format!("${}", self.param_offset + self.params.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{physical, query_info::FactColumnInfo, types::Backend};
    use crate::query_info::DimensionColumnInfo;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn info() -> DataSeriesQueryInfo {
        let ds = Uuid::new_v4();
        let mk = |ext: &str| FactColumnInfo {
            column_name: format!("f_00000000_{ext}"),
            fact_id: Uuid::new_v4(),
            link_id: Uuid::new_v4(),
            optional: true,
        };
        let mut facts = BTreeMap::new();
        facts.insert(
            FactKind::Float,
            BTreeMap::from([("height".to_string(), mk("height"))]),
        );
        facts.insert(
            FactKind::String,
            BTreeMap::from([("label".to_string(), mk("label"))]),
        );
        facts.insert(
            FactKind::Timestamp,
            BTreeMap::from([("seen_at".to_string(), mk("seen_at"))]),
        );
        facts.insert(
            FactKind::Json,
            BTreeMap::from([("meta".to_string(), mk("meta"))]),
        );
        let dimensions = BTreeMap::from([(
            "room".to_string(),
            DimensionColumnInfo {
                column_name: "d_00000000_room".to_string(),
                link_id: Uuid::new_v4(),
                reference_data_series_id: "5c48e8bc-40ff-45b6-b968-62ed8a3b24a9"
                    .parse()
                    .unwrap(),
                optional: true,
            },
        )]);
        DataSeriesQueryInfo {
            data_series_id: ds,
            tenant_id: Uuid::new_v4(),
            backend: Backend::Materialized,
            allow_extra_fields: false,
            schema_name: "ds_t_test".to_string(),
            main_query_table: crate::ident::quote_qualified(
                "ds_t_test",
                &physical::mat_table_name(ds),
            ),
            alive_filter: "\"deleted_at\" IS NULL".to_string(),
            facts,
            dimensions,
            extra_query_fields: vec![],
            data_point_serialization_keys: vec![],
        }
    }

    fn compile(filter: &JsonValue) -> Result<CompiledFilter, ValidationError> {
        let filter = Filter::parse(filter, DEFAULT_MAX_DEPTH)?;
        compile_filter(&filter, &info(), true, 0)
    }

    #[test]
    fn bare_value_is_eq() {
        let compiled = compile(&json!({"height": 1.5})).unwrap();
        assert_eq!(compiled.sql, "(t.\"f_00000000_height\")::double precision = $1");
        assert_eq!(compiled.params, vec![sea_orm::Value::from(1.5)]);
        assert!(compiled.referenced_columns.contains("f_00000000_height"));
    }

    #[test]
    fn null_compiles_to_is_null() {
        let compiled = compile(&json!({"label": null})).unwrap();
        assert_eq!(compiled.sql, "t.\"f_00000000_label\" IS NULL");
        assert!(compiled.params.is_empty());

        let compiled = compile(&json!({"label": {"$ne": null}})).unwrap();
        assert_eq!(compiled.sql, "t.\"f_00000000_label\" IS NOT NULL");
    }

    #[test]
    fn unknown_fields_reported_together() {
        let err = compile(&json!({"a": 1, "b": 2, "label": "x"})).unwrap_err();
        match err {
            ValidationError::UnknownFields(fields) => {
                assert_eq!(fields, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn type_mismatch_is_field_scoped() {
        let err = compile(&json!({"height": "tall"})).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::WrongType { ref field, .. } if field == "height"
        ));
    }

    #[test]
    fn in_and_nin() {
        let compiled = compile(&json!({"label": {"$in": ["a", "b"]}})).unwrap();
        assert_eq!(compiled.sql, "t.\"f_00000000_label\" IN ($1, $2)");
        assert_eq!(compiled.params.len(), 2);

        let compiled = compile(&json!({"label": {"$in": []}})).unwrap();
        assert_eq!(compiled.sql, "1=0");
        let compiled = compile(&json!({"label": {"$nin": []}})).unwrap();
        assert_eq!(compiled.sql, "1=1");
    }

    #[test]
    fn prefix_escapes_like_wildcards() {
        let compiled = compile(&json!({"label": {"$prefix": "50%_a"}})).unwrap();
        assert_eq!(compiled.sql, "t.\"f_00000000_label\" LIKE $1");
        assert_eq!(
            compiled.params,
            vec![sea_orm::Value::from("50\\%\\_a%".to_string())]
        );

        let err = compile(&json!({"height": {"$prefix": "1"}})).unwrap_err();
        assert!(matches!(err, ValidationError::WrongType { .. }));
    }

    #[test]
    fn nested_and_or() {
        let compiled = compile(&json!({
            "$or": [
                {"label": "a"},
                {"$and": [{"height": {"$gte": 1.0}}, {"height": {"$lt": 2.0}}]}
            ]
        }))
        .unwrap();
        assert_eq!(
            compiled.sql,
            "(t.\"f_00000000_label\" = $1 OR \
             ((t.\"f_00000000_height\")::double precision >= $2 AND \
             (t.\"f_00000000_height\")::double precision < $3))"
        );
        assert_eq!(compiled.params.len(), 3);
    }

    #[test]
    fn multiple_operators_on_one_field_are_anded() {
        let compiled = compile(&json!({"height": {"$gte": 1.0, "$lt": 2.0}})).unwrap();
        assert_eq!(
            compiled.sql,
            "((t.\"f_00000000_height\")::double precision >= $1 AND \
             (t.\"f_00000000_height\")::double precision < $2)"
        );
        assert_eq!(compiled.params.len(), 2);

        // operators cannot be mixed with plain keys in one map
        let err = compile(&json!({"height": {"$gte": 1.0, "raw": 2.0}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFilter(_)));
    }

    #[test]
    fn depth_cap_is_a_validation_failure() {
        let mut filter = json!({"label": "x"});
        for _ in 0..12 {
            filter = json!({ "$and": [filter] });
        }
        let err = Filter::parse(&filter, DEFAULT_MAX_DEPTH).unwrap_err();
        assert!(matches!(err, ValidationError::FilterTooDeep(10)));
    }

    #[test]
    fn dimension_by_external_id_uses_deterministic_id() {
        let compiled = compile(&json!({"room": "kitchen"})).unwrap();
        assert_eq!(compiled.sql, "t.\"d_00000000_room\" = $1");
        let reference: Uuid = "5c48e8bc-40ff-45b6-b968-62ed8a3b24a9".parse().unwrap();
        assert_eq!(
            compiled.params,
            vec![sea_orm::Value::from(data_point_id(reference, "kitchen"))]
        );
        // ordering operators are rejected on dimensions
        let err = compile(&json!({"room": {"$lt": "a"}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn json_facts_cannot_be_ordered() {
        let err = compile(&json!({"meta": {"$gt": 1}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn param_offset_continues_numbering() {
        let filter = Filter::parse(&json!({"label": "a"}), DEFAULT_MAX_DEPTH).unwrap();
        let compiled = compile_filter(&filter, &info(), true, 4).unwrap();
        assert_eq!(compiled.sql, "t.\"f_00000000_label\" = $5");
    }

    #[test]
    fn history_path_uses_version_aliases() {
        let filter = Filter::parse(&json!({"label": "a"}), DEFAULT_MAX_DEPTH).unwrap();
        let compiled = compile_filter(&filter, &info(), false, 0).unwrap();
        assert_eq!(compiled.sql, "v_f_00000000_label.\"value\" = $1");
    }

    #[test]
    fn timestamps_validated_before_binding() {
        let err = compile(&json!({"seen_at": "never"})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
        let ok = compile(&json!({"seen_at": {"$gte": "2024-01-01T00:00:00Z"}})).unwrap();
        assert_eq!(ok.params.len(), 1);
    }
}
