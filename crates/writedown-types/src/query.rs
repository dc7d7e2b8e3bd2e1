use std::cmp::Ordering;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::models::Document;
use crate::timestamp::ServerTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("collection path is empty")]
    EmptyCollection,
    #[error("collection path '{0}' is malformed")]
    MalformedCollection(String),
    #[error("order field is empty")]
    EmptyOrderField,
    #[error("order field '{0}' may only contain letters, digits and '_'")]
    BadOrderField(String),
    #[error("page size must be greater than zero")]
    ZeroPageSize,
}

/// An ordered, limited view of one collection: what to subscribe to and
/// how to page through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub collection_path: String,
    pub order_field: String,
    pub page_size: u32,
}

impl QueryDescriptor {
    pub fn new(
        collection_path: impl Into<String>,
        order_field: impl Into<String>,
        page_size: u32,
    ) -> Self {
        Self {
            collection_path: collection_path.into(),
            order_field: order_field.into(),
            page_size,
        }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        validate_collection_path(&self.collection_path)?;

        if self.order_field.is_empty() {
            return Err(QueryError::EmptyOrderField);
        }
        if !self
            .order_field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(QueryError::BadOrderField(self.order_field.clone()));
        }
        if self.page_size == 0 {
            return Err(QueryError::ZeroPageSize);
        }
        Ok(())
    }

    /// JSON path of the order field, for stores that index JSON documents.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.order_field)
    }

    /// Where `doc` sits in this query's order. `None` means the document has
    /// no usable order value and is not part of the ordered collection.
    pub fn position(&self, doc: &Document) -> Option<Cursor> {
        let key = SortKey::from_value(doc.fields.get(&self.order_field)?)?;
        Some(Cursor {
            key,
            id: doc.id.clone(),
        })
    }
}

/// Collection paths alternate collection and document segments and end on
/// a collection: `channels`, `channels/{id}/messages`.
pub fn validate_collection_path(path: &str) -> Result<(), QueryError> {
    if path.is_empty() {
        return Err(QueryError::EmptyCollection);
    }
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) || segments.len() % 2 == 0 {
        return Err(QueryError::MalformedCollection(path.to_string()));
    }
    Ok(())
}

/// Comparable projection of an order-field value.
///
/// Numbers sort before text, and a pending server timestamp sorts after
/// everything, since it will resolve to "now".
#[derive(Debug, Clone)]
pub enum SortKey {
    Number(f64),
    Text(String),
    Pending,
}

impl SortKey {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            v if ServerTimestamp::is_sentinel(v) => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Pending => ServerTimestamp::sentinel(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Text(_) => 1,
            Self::Pending => 2,
        }
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

impl Serialize for SortKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SortKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).ok_or_else(|| {
            serde::de::Error::custom("sort key must be a number, text or server timestamp")
        })
    }
}

/// A position in a query's order: the sort key plus the document id that
/// breaks ties. Used both as the "fetch after" cursor and to place live
/// changes relative to the loaded window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub key: SortKey,
    pub id: String,
}
