//! Row decoding into JSON maps.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction
//!
//! SQLite is dynamically typed, so its decoder classifies by the stored
//! value's storage class and only consults the declared type for booleans.

use crate::models::{DatabaseType, JsonRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    Date,
    Time,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.starts_with("timestamp") || lower == "datetime" {
        return TypeCategory::Timestamp;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower == "time" || lower == "timetz" {
        return TypeCategory::Time;
    }

    TypeCategory::Text
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary column data as base64.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let category = categorize_type(col.type_info().name(), DatabaseType::MySQL);
                (col.name().to_string(), mysql::decode_column(self, col.ordinal(), category))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let category = categorize_type(col.type_info().name(), DatabaseType::PostgreSQL);
                (col.name().to_string(), postgres::decode_column(self, col.ordinal(), category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .map(|col| {
                let declared = categorize_type(col.type_info().name(), DatabaseType::SQLite);
                (col.name().to_string(), sqlite::decode_column(self, col.ordinal(), declared))
            })
            .collect()
    }
}

/// Try each listed type in order, returning the first successful decode as JSON.
macro_rules! decode_first {
    ($row:expr, $idx:expr, $($ty:ty => $conv:expr),+ $(,)?) => {{
        $(
            if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                return $conv(v);
            }
        )+
        JsonValue::Null
    }};
}

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true) {
            return JsonValue::Null;
        }
        match category {
            TypeCategory::Decimal => decode_first!(row, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0)),
            TypeCategory::Integer => decode_first!(row, idx,
                i64 => |v: i64| JsonValue::from(v),
                i32 => |v: i32| JsonValue::from(v),
                i16 => |v: i16| JsonValue::from(v),
                i8 => |v: i8| JsonValue::from(v),
                u64 => |v: u64| JsonValue::from(v),
                u32 => |v: u32| JsonValue::from(v),
                u16 => |v: u16| JsonValue::from(v),
                u8 => |v: u8| JsonValue::from(v),
            ),
            TypeCategory::Boolean => decode_first!(row, idx, bool => JsonValue::Bool),
            TypeCategory::Float => decode_first!(row, idx,
                f64 => float_value,
                f32 => |v: f32| float_value(f64::from(v)),
            ),
            TypeCategory::Binary => decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| decode_binary_value(&v)),
            TypeCategory::Json => decode_first!(row, idx, JsonValue => |v| v),
            TypeCategory::Timestamp => decode_first!(row, idx,
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
            ),
            TypeCategory::Date => decode_first!(row, idx, NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string())),
            TypeCategory::Time => decode_first!(row, idx, NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string())),
            TypeCategory::Text => decode_first!(row, idx,
                String => JsonValue::String,
                Vec<u8> => |v: Vec<u8>| decode_binary_value(&v),
            ),
        }
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        if row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true) {
            return JsonValue::Null;
        }
        match category {
            TypeCategory::Decimal => decode_first!(row, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0)),
            TypeCategory::Integer => decode_first!(row, idx,
                i64 => |v: i64| JsonValue::from(v),
                i32 => |v: i32| JsonValue::from(v),
                i16 => |v: i16| JsonValue::from(v),
            ),
            TypeCategory::Boolean => decode_first!(row, idx, bool => JsonValue::Bool),
            TypeCategory::Float => decode_first!(row, idx,
                f64 => float_value,
                f32 => |v: f32| float_value(f64::from(v)),
            ),
            TypeCategory::Binary => decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| decode_binary_value(&v)),
            TypeCategory::Json => decode_first!(row, idx, JsonValue => |v| v),
            TypeCategory::Timestamp => decode_first!(row, idx,
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
            ),
            TypeCategory::Date => decode_first!(row, idx, NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string())),
            TypeCategory::Time => decode_first!(row, idx, NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string())),
            TypeCategory::Text => decode_first!(row, idx, String => JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, declared: TypeCategory) -> JsonValue {
        let storage = match row.try_get_raw(idx) {
            Ok(raw) if !raw.is_null() => raw.type_info().name().to_uppercase(),
            _ => return JsonValue::Null,
        };
        match storage.as_str() {
            "INTEGER" if declared == TypeCategory::Boolean => {
                decode_first!(row, idx, bool => JsonValue::Bool)
            }
            "INTEGER" => decode_first!(row, idx, i64 => |v: i64| JsonValue::from(v)),
            "REAL" => decode_first!(row, idx, f64 => float_value),
            "BLOB" => decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| decode_binary_value(&v)),
            _ => {
                if let Ok(Some(text)) = row.try_get::<Option<String>, _>(idx) {
                    if declared == TypeCategory::Json {
                        if let Ok(json) = serde_json::from_str::<JsonValue>(&text) {
                            return json;
                        }
                    }
                    return JsonValue::String(text);
                }
                JsonValue::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySQL),
            TypeCategory::Decimal
        );
        // SQLite NUMERIC is a float
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATE", DatabaseType::MySQL),
            TypeCategory::Date
        );
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySQL),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_decode_binary_value() {
        assert_eq!(
            decode_binary_value(&[0xFF, 0xFE, 0x00, 0x01]),
            JsonValue::String("//4AAQ==".to_string())
        );
        assert_eq!(decode_binary_value(&[]), JsonValue::String(String::new()));
    }
}
