//! Database row types. These map directly to SQLite rows and are distinct
//! from the `Document` model to keep the storage layer independent.

use serde_json::{Map, Value};
use writedown_types::Document;

use crate::{DbError, Result};

pub struct DocumentRow {
    pub id: String,
    pub fields: String,
}

impl DocumentRow {
    pub fn into_document(self) -> Result<Document> {
        let fields: Map<String, Value> =
            serde_json::from_str(&self.fields).map_err(|source| DbError::Corrupt {
                id: self.id.clone(),
                source,
            })?;
        Ok(Document::new(self.id, fields))
    }
}
