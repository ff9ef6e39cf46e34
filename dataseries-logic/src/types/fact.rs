use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use dataseries_entity::sea_orm_active_enums::FactKindType;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The eight typed fact kinds. Kind-specific SQL type mapping lives here and
/// nowhere else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Float,
    String,
    Text,
    Timestamp,
    Image,
    File,
    Json,
    Boolean,
}

impl FactKind {
    pub const ALL: [FactKind; 8] = [
        FactKind::Float,
        FactKind::String,
        FactKind::Text,
        FactKind::Timestamp,
        FactKind::Image,
        FactKind::File,
        FactKind::Json,
        FactKind::Boolean,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactKind::Float => "float",
            FactKind::String => "string",
            FactKind::Text => "text",
            FactKind::Timestamp => "timestamp",
            FactKind::Image => "image",
            FactKind::File => "file",
            FactKind::Json => "json",
            FactKind::Boolean => "boolean",
        }
    }

    /// Postgres column type for the fact's value. Image and file facts store
    /// the blob key, never the blob itself.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FactKind::Float => "double precision",
            FactKind::String => "varchar",
            FactKind::Text => "text",
            FactKind::Timestamp => "timestamptz",
            FactKind::Image | FactKind::File => "varchar",
            FactKind::Json => "jsonb",
            FactKind::Boolean => "boolean",
        }
    }

    pub fn is_blob(&self) -> bool {
        matches!(self, FactKind::Image | FactKind::File)
    }

    /// A typed SQL NULL, so sqlx can infer the parameter type.
    pub fn null_value(&self) -> sea_orm::Value {
        match self {
            FactKind::Float => sea_orm::Value::Double(None),
            FactKind::String | FactKind::Text | FactKind::Image | FactKind::File => {
                sea_orm::Value::String(None)
            }
            FactKind::Timestamp => sea_orm::Value::ChronoDateTimeUtc(None),
            FactKind::Json => sea_orm::Value::Json(None),
            FactKind::Boolean => sea_orm::Value::Bool(None),
        }
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FactKindType> for FactKind {
    fn from(value: FactKindType) -> Self {
        match value {
            FactKindType::Float => FactKind::Float,
            FactKindType::String => FactKind::String,
            FactKindType::Text => FactKind::Text,
            FactKindType::Timestamp => FactKind::Timestamp,
            FactKindType::Image => FactKind::Image,
            FactKindType::File => FactKind::File,
            FactKindType::Json => FactKind::Json,
            FactKindType::Boolean => FactKind::Boolean,
        }
    }
}

impl From<FactKind> for FactKindType {
    fn from(value: FactKind) -> Self {
        match value {
            FactKind::Float => FactKindType::Float,
            FactKind::String => FactKindType::String,
            FactKind::Text => FactKindType::Text,
            FactKind::Timestamp => FactKindType::Timestamp,
            FactKind::Image => FactKindType::Image,
            FactKind::File => FactKindType::File,
            FactKind::Json => FactKindType::Json,
            FactKind::Boolean => FactKindType::Boolean,
        }
    }
}

/// A validated, typed fact value ready for parameter binding.
#[derive(Clone, Debug, PartialEq)]
pub enum FactValue {
    Float(f64),
    String(String),
    Text(String),
    Timestamp(DateTime<Utc>),
    Image(String),
    File(String),
    Json(JsonValue),
    Boolean(bool),
}

impl FactValue {
    /// Strict per-kind validation of an incoming JSON value. `null` maps to
    /// `Ok(None)`; a mismatched type is a field-scoped validation error
    /// raised before any SQL runs.
    pub fn parse(
        kind: FactKind,
        field: &str,
        value: &JsonValue,
    ) -> Result<Option<Self>, ValidationError> {
        if value.is_null() {
            return Ok(None);
        }
        let wrong = |expected: &'static str| ValidationError::WrongType {
            field: field.to_string(),
            expected,
        };
        let parsed = match kind {
            FactKind::Float => FactValue::Float(
                value
                    .as_f64()
                    .ok_or_else(|| wrong("a float value"))?,
            ),
            FactKind::String => FactValue::String(
                value
                    .as_str()
                    .ok_or_else(|| wrong("a string value"))?
                    .to_string(),
            ),
            FactKind::Text => FactValue::Text(
                value
                    .as_str()
                    .ok_or_else(|| wrong("a text value"))?
                    .to_string(),
            ),
            FactKind::Timestamp => {
                let raw = value.as_str().ok_or_else(|| wrong("a timestamp string"))?;
                let ts = DateTime::parse_from_rfc3339(raw).map_err(|e| {
                    ValidationError::InvalidValue {
                        field: field.to_string(),
                        message: format!("invalid timestamp: {e}"),
                    }
                })?;
                FactValue::Timestamp(ts.with_timezone(&Utc))
            }
            FactKind::Image => FactValue::Image(
                value
                    .as_str()
                    .ok_or_else(|| wrong("an image blob key"))?
                    .to_string(),
            ),
            FactKind::File => FactValue::File(
                value
                    .as_str()
                    .ok_or_else(|| wrong("a file blob key"))?
                    .to_string(),
            ),
            FactKind::Json => FactValue::Json(value.clone()),
            FactKind::Boolean => FactValue::Boolean(
                value
                    .as_bool()
                    .ok_or_else(|| wrong("a boolean value"))?,
            ),
        };
        Ok(Some(parsed))
    }

    pub fn kind(&self) -> FactKind {
        match self {
            FactValue::Float(_) => FactKind::Float,
            FactValue::String(_) => FactKind::String,
            FactValue::Text(_) => FactKind::Text,
            FactValue::Timestamp(_) => FactKind::Timestamp,
            FactValue::Image(_) => FactKind::Image,
            FactValue::File(_) => FactKind::File,
            FactValue::Json(_) => FactKind::Json,
            FactValue::Boolean(_) => FactKind::Boolean,
        }
    }

    pub fn blob_key(&self) -> Option<&str> {
        match self {
            FactValue::Image(key) | FactValue::File(key) => Some(key),
            _ => None,
        }
    }

    pub fn to_sea_value(&self) -> sea_orm::Value {
        match self {
            FactValue::Float(v) => (*v).into(),
            FactValue::String(v) | FactValue::Text(v) => v.clone().into(),
            FactValue::Timestamp(v) => (*v).into(),
            FactValue::Image(v) | FactValue::File(v) => v.clone().into(),
            FactValue::Json(v) => v.clone().into(),
            FactValue::Boolean(v) => (*v).into(),
        }
    }
}
