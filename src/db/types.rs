//! Row decoding.
//!
//! Every backend row is normalized to a [`Row`]: a JSON object keyed by column
//! name, in column order.
//!
//! # Architecture
//!
//! PostgreSQL and MySQL report a column type per result column, so decoding
//! is two-phase:
//! 1. `categorize_type` classifies the column type name into a logical category
//! 2. Backend-specific decoders extract the value for that category
//!
//! SQLite is dynamically typed; its decoder dispatches on the storage class of
//! each value and uses the declared column type only to recognise booleans and
//! JSON text. The executor looks declared types up itself, since sqlx hides
//! declarations it has no Rust type for (such as `JSON`).

use crate::error::{DbError, DbResult};
use crate::models::Row;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

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
    Uuid,
    Temporal,
    Unknown,
}

/// Classify a column type name (as reported by the driver) into a category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    let base = lower.trim_end_matches(" unsigned");

    match base {
        "decimal" | "numeric" => TypeCategory::Decimal,
        "bool" | "boolean" => TypeCategory::Boolean,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2" | "int4"
        | "int8" => TypeCategory::Integer,
        "float" | "double" | "real" | "float4" | "float8" | "double precision" => {
            TypeCategory::Float
        }
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "date" | "time" | "datetime" | "timestamp" | "timestamptz" => TypeCategory::Temporal,
        "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" => {
            TypeCategory::Binary
        }
        "text" | "varchar" | "char" | "bpchar" | "name" | "citext" | "tinytext"
        | "mediumtext" | "longtext" | "enum" | "set" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Raw Text Decoding
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

/// Textual form of a value whose type has no dedicated decoder
/// (PostgreSQL enums, MySQL SET columns and similar).
#[derive(Debug)]
pub struct RawText(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        categorize_type(ty.name()) == TypeCategory::Decimal
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
        categorize_type(ty.name()) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_from_binary(value.as_bytes()?)?)),
        }
    }
}

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as a decimal
/// string with exactly `dscale` fractional digits.
fn numeric_from_binary(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    if buf.len() < 8 {
        return Err("NUMERIC value too short".into());
    }
    let word = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
    let ndigits = usize::from(word(0));
    let weight = i32::from(word(2) as i16);
    let sign = word(4);
    let dscale = usize::from(word(6));

    if buf.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| word(8 + i * 2)).collect();
    let group = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        other => return Err(format!("Invalid NUMERIC sign {other:#x}").into()),
    };

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", group(i)));
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

impl Type<sqlx::MySql> for RawText {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(_ty: &MySqlTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawText {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawText(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawText {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawText(s.to_string()))
    }
}

// =============================================================================
// Value Helpers
// =============================================================================

/// Encode binary data as a base64 JSON string.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// JSON number for finite floats, string for NaN and infinities.
fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn undecodable(column: &str, type_name: &str) -> DbError {
    DbError::decode(format!(
        "Cannot decode column '{}' of type {}",
        column, type_name
    ))
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to normalized JSON rows.
pub trait RowToJson {
    fn to_row(&self) -> DbResult<Row>;
}

impl RowToJson for MySqlRow {
    fn to_row(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let value = mysql::decode_column(self, col.ordinal(), categorize_type(type_name))
                    .map_err(|_| undecodable(col.name(), type_name))?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

impl RowToJson for PgRow {
    fn to_row(&self) -> DbResult<Row> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let value =
                    postgres::decode_column(self, col.ordinal(), categorize_type(type_name))
                        .map_err(|_| undecodable(col.name(), type_name))?;
                Ok((col.name().to_string(), value))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_row(&self) -> DbResult<Row> {
        sqlite_row_to_json(self, &[])
    }
}

/// Decode a SQLite row using the declared column types where known
/// (`declared[i]` for column `i`), falling back to what sqlx reports.
pub fn sqlite_row_to_json(row: &SqliteRow, declared: &[Option<String>]) -> DbResult<Row> {
    row.columns()
        .iter()
        .map(|col| {
            let type_name = declared
                .get(col.ordinal())
                .and_then(Option::as_deref)
                .unwrap_or_else(|| col.type_info().name());
            let value = sqlite::decode_column(row, col.ordinal(), type_name)
                .map_err(|_| undecodable(col.name(), type_name))?;
            Ok((col.name().to_string(), value))
        })
        .collect()
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(JsonValue::Null);
        }

        match category {
            TypeCategory::Decimal => Ok(JsonValue::String(row.try_get::<RawDecimal, _>(idx)?.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => Ok(JsonValue::Bool(row.try_get::<bool, _>(idx)?)),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => Ok(encode_binary(&row.try_get::<Vec<u8>, _>(idx)?)),
            TypeCategory::Json => row.try_get::<JsonValue, _>(idx),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Text | TypeCategory::Uuid | TypeCategory::Unknown => {
                match row.try_get::<String, _>(idx) {
                    Ok(v) => Ok(JsonValue::String(v)),
                    Err(_) => Ok(JsonValue::String(row.try_get::<RawText, _>(idx)?.0)),
                }
            }
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        match row.try_get::<i64, _>(idx) {
            Ok(v) => Ok(JsonValue::Number(v.into())),
            // BIGINT UNSIGNED
            Err(_) => Ok(JsonValue::Number(row.try_get::<u64, _>(idx)?.into())),
        }
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        match row.try_get::<f64, _>(idx) {
            Ok(v) => Ok(float_value(v)),
            Err(_) => Ok(float_value(f64::from(row.try_get::<f32, _>(idx)?))),
        }
    }

    /// Dates render as `YYYY-MM-DD`, datetimes as `YYYY-MM-DD HH:MM:SS[.ffffff]`.
    fn decode_temporal(row: &MySqlRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
            return Ok(JsonValue::String(v.to_string()));
        }
        if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
            return Ok(JsonValue::String(v.to_string()));
        }
        let v = row.try_get::<NaiveTime, _>(idx)?;
        Ok(JsonValue::String(v.to_string()))
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(JsonValue::Null);
        }

        match category {
            TypeCategory::Decimal => Ok(JsonValue::String(row.try_get::<RawDecimal, _>(idx)?.0)),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => Ok(JsonValue::Bool(row.try_get::<bool, _>(idx)?)),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Binary => Ok(encode_binary(&row.try_get::<Vec<u8>, _>(idx)?)),
            TypeCategory::Json => row.try_get::<JsonValue, _>(idx),
            TypeCategory::Uuid => Ok(JsonValue::String(
                row.try_get::<uuid::Uuid, _>(idx)?.to_string(),
            )),
            TypeCategory::Temporal => decode_temporal(row, idx),
            TypeCategory::Text | TypeCategory::Unknown => match row.try_get::<String, _>(idx) {
                Ok(v) => Ok(JsonValue::String(v)),
                Err(_) => Ok(JsonValue::String(row.try_get::<RawText, _>(idx)?.0)),
            },
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(JsonValue::Number(v.into()));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Ok(JsonValue::Number(v.into()));
        }
        Ok(JsonValue::Number(row.try_get::<i16, _>(idx)?.into()))
    }

    fn decode_float(row: &PgRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        match row.try_get::<f64, _>(idx) {
            Ok(v) => Ok(float_value(v)),
            Err(_) => Ok(float_value(f64::from(row.try_get::<f32, _>(idx)?))),
        }
    }

    /// `timestamptz` renders as RFC 3339 in UTC; naive types use ISO 8601.
    fn decode_temporal(row: &PgRow, idx: usize) -> Result<JsonValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Ok(JsonValue::String(
                v.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ));
        }
        if let Ok(v) = row.try_get::<NaiveDateTime, _>(idx) {
            return Ok(JsonValue::String(
                v.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ));
        }
        if let Ok(v) = row.try_get::<NaiveDate, _>(idx) {
            return Ok(JsonValue::String(v.to_string()));
        }
        let v = row.try_get::<NaiveTime, _>(idx)?;
        Ok(JsonValue::String(v.to_string()))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        declared: &str,
    ) -> Result<JsonValue, sqlx::Error> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let storage = raw.type_info().name().to_string();
        let category = categorize_type(declared);

        match storage.as_str() {
            "INTEGER" => {
                let v = row.try_get::<i64, _>(idx)?;
                if category == TypeCategory::Boolean {
                    Ok(JsonValue::Bool(v != 0))
                } else {
                    Ok(JsonValue::Number(v.into()))
                }
            }
            "REAL" => Ok(float_value(row.try_get::<f64, _>(idx)?)),
            "BLOB" => Ok(encode_binary(&row.try_get::<Vec<u8>, _>(idx)?)),
            _ => {
                let v = row.try_get::<String, _>(idx)?;
                if category == TypeCategory::Json {
                    if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                        return Ok(json);
                    }
                }
                Ok(JsonValue::String(v))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_integers() {
        for name in ["INT", "INTEGER", "BIGINT", "INT8", "INT4", "TINYINT", "INT UNSIGNED"] {
            assert_eq!(categorize_type(name), TypeCategory::Integer, "{name}");
        }
    }

    #[test]
    fn test_categorize_does_not_match_substrings() {
        assert_eq!(categorize_type("TINYTEXT"), TypeCategory::Text);
        assert_eq!(categorize_type("INTERVAL"), TypeCategory::Unknown);
        assert_eq!(categorize_type("POINT"), TypeCategory::Unknown);
    }

    #[test]
    fn test_categorize_other_types() {
        assert_eq!(categorize_type("NUMERIC"), TypeCategory::Decimal);
        assert_eq!(categorize_type("DECIMAL"), TypeCategory::Decimal);
        assert_eq!(categorize_type("BOOL"), TypeCategory::Boolean);
        assert_eq!(categorize_type("BOOLEAN"), TypeCategory::Boolean);
        assert_eq!(categorize_type("FLOAT8"), TypeCategory::Float);
        assert_eq!(categorize_type("DOUBLE"), TypeCategory::Float);
        assert_eq!(categorize_type("JSONB"), TypeCategory::Json);
        assert_eq!(categorize_type("UUID"), TypeCategory::Uuid);
        assert_eq!(categorize_type("TIMESTAMPTZ"), TypeCategory::Temporal);
        assert_eq!(categorize_type("DATETIME"), TypeCategory::Temporal);
        assert_eq!(categorize_type("BYTEA"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARBINARY"), TypeCategory::Binary);
        assert_eq!(categorize_type("VARCHAR"), TypeCategory::Text);
    }

    fn numeric_bytes(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(digits.len() as u16).to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        for d in digits {
            buf.extend_from_slice(&d.to_be_bytes());
        }
        buf
    }

    #[test]
    fn test_numeric_from_binary() {
        let cases: [(Vec<u8>, &str); 7] = [
            (numeric_bytes(0, 0, 2, &[12, 5000]), "12.50"),
            (numeric_bytes(-1, 0, 2, &[500]), "0.05"),
            (numeric_bytes(-2, 0, 5, &[5000]), "0.00005"),
            (numeric_bytes(0, 0, 2, &[]), "0.00"),
            (numeric_bytes(1, 0, 0, &[1]), "10000"),
            (numeric_bytes(1, 0x4000, 3, &[12, 3456, 7800]), "-123456.780"),
            (numeric_bytes(0, 0xC000, 0, &[]), "NaN"),
        ];
        for (bytes, expected) in cases {
            assert_eq!(numeric_from_binary(&bytes).unwrap(), expected);
        }
        assert!(numeric_from_binary(&[0, 1]).is_err());
        assert!(numeric_from_binary(&numeric_bytes(0, 0x1234, 0, &[1])).is_err());
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(encode_binary(b"hi"), JsonValue::String("aGk=".into()));
    }

    #[test]
    fn test_float_value_non_finite() {
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
        assert_eq!(float_value(f64::NAN), JsonValue::String("NaN".into()));
        assert_eq!(float_value(f64::INFINITY), JsonValue::String("inf".into()));
    }
}
