//! Query-related data models.
//!
//! This module defines statement parameters and the normalized result shapes
//! shared by every backend.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// A normalized result row: column name to value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Arrays and objects, bound as the backend's JSON type
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Parse a command-line value: JSON when it parses, otherwise a plain string.
    pub fn parse_lenient(raw: &str) -> Self {
        match serde_json::from_str::<JsonValue>(raw) {
            Ok(value) => value.into(),
            Err(_) => Self::String(raw.to_string()),
        }
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    Self::Int(i64::from(v))
                }
            }
        )+
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f32> for QueryParam {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&String> for QueryParam {
    fn from(v: &String) -> Self {
        Self::String(v.clone())
    }
}

impl From<&[u8]> for QueryParam {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

/// Parameters for one statement.
///
/// Positional values bind to the statement's own placeholders (`?` or `$n`).
/// Named values bind to `:name` placeholders, which are rewritten to the
/// backend's positional syntax before the statement is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<QueryParam>),
    Named(BTreeMap<String, QueryParam>),
}

impl Params {
    /// Build positional parameters.
    pub fn positional<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        Self::Positional(values.into_iter().map(Into::into).collect())
    }

    /// Build named parameters. Names are given without the leading `:`.
    pub fn named<I, K, T>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<QueryParam>,
    {
        Self::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Interpret a JSON request payload as parameters.
    ///
    /// Arrays are positional, objects are named, `null` means no parameters and
    /// any other scalar is a single positional value.
    pub fn from_json(value: JsonValue) -> DbResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::None),
            JsonValue::Array(items) => Ok(Self::positional(items)),
            JsonValue::Object(map) => {
                for key in map.keys() {
                    if key.is_empty() {
                        return Err(DbError::invalid_input("Parameter names cannot be empty"));
                    }
                }
                Ok(Self::named(map))
            }
            scalar => Ok(Self::Positional(vec![scalar.into()])),
        }
    }

    /// Number of values supplied.
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(values) => values.len(),
            Self::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Self::None
    }
}

impl<T: Into<QueryParam>> From<Vec<T>> for Params {
    fn from(values: Vec<T>) -> Self {
        Self::positional(values)
    }
}

impl<T: Into<QueryParam>, const N: usize> From<[T; N]> for Params {
    fn from(values: [T; N]) -> Self {
        Self::positional(values)
    }
}

impl<T: Into<QueryParam>> From<BTreeMap<String, T>> for Params {
    fn from(values: BTreeMap<String, T>) -> Self {
        Self::named(values)
    }
}

impl<T: Into<QueryParam>> From<HashMap<String, T>> for Params {
    fn from(values: HashMap<String, T>) -> Self {
        Self::named(values)
    }
}

/// Outcome of a mutating statement, or of a batch of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    /// Affected rows as reported by the backend.
    pub row_count: u64,
    /// Generated identifier, when the backend reports a non-zero one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<i64>,
    /// Rows produced by a `RETURNING` clause (PostgreSQL only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Row>,
}

impl ExecuteResult {
    /// Create a result, treating an insert id of 0 as "none generated".
    pub fn new(row_count: u64, insert_id: Option<i64>) -> Self {
        Self {
            row_count,
            insert_id: insert_id.filter(|id| *id != 0),
            rows: Vec::new(),
        }
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    /// Fold a later statement's result into this aggregate.
    ///
    /// Row counts add up, the most recent non-zero insert id wins and
    /// returned rows are appended in order.
    pub fn absorb(&mut self, later: ExecuteResult) {
        self.row_count += later.row_count;
        if let Some(id) = later.insert_id.filter(|id| *id != 0) {
            self.insert_id = Some(id);
        }
        self.rows.extend(later.rows);
    }
}
