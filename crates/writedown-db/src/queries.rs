use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value};
use tracing::debug;

use writedown_types::{Cursor, Document, QueryDescriptor, ServerTimestamp, SortKey};

use crate::models::DocumentRow;
use crate::{Database, DbError, Result};

/// Only numbers and text take part in ordered queries, mirroring `SortKey`.
const ORDERABLE: &str = "json_type(fields, ?2) IN ('integer', 'real', 'text')";

impl Database {
    // -- Reads --

    /// Up to `query.page_size` documents strictly after `after`, in
    /// `(order value, id)` order.
    pub fn fetch_page(
        &self,
        query: &QueryDescriptor,
        after: Option<&Cursor>,
    ) -> Result<Vec<Document>> {
        query.validate()?;
        self.with_conn(|conn| query_page(conn, query, after, Some(query.page_size)))
    }

    /// Every orderable document of the collection, in query order.
    pub fn fetch_all(&self, query: &QueryDescriptor) -> Result<Vec<Document>> {
        query.validate()?;
        self.with_conn(|conn| query_page(conn, query, None, None))
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.with_conn(|conn| query_document(conn, collection, id))
    }

    // -- Writes --
    //
    // Every write resolves server timestamp sentinels and returns the
    // document exactly as stored.

    pub fn create_document(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<Document> {
        self.create_document_at(collection, id, fields, Utc::now())
    }

    pub fn create_document_at(
        &self,
        collection: &str,
        id: &str,
        mut fields: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Document> {
        ServerTimestamp::resolve_sentinels(&mut fields, now);
        let stamp = ServerTimestamp::format(now);
        let body = serde_json::to_string(&fields)?;

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO documents (collection, id, fields, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![collection, id, body, stamp],
            )?;
            if inserted == 0 {
                return Err(DbError::AlreadyExists {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            Ok(())
        })?;

        debug!("created {}/{}", collection, id);
        Ok(Document::new(id, fields))
    }

    /// Create or replace. Returns the stored document and whether it is new.
    pub fn set_document(
        &self,
        collection: &str,
        id: &str,
        mut fields: Map<String, Value>,
    ) -> Result<(Document, bool)> {
        let now = Utc::now();
        ServerTimestamp::resolve_sentinels(&mut fields, now);
        let stamp = ServerTimestamp::format(now);
        let body = serde_json::to_string(&fields)?;

        let created = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existed = tx
                .query_row(
                    "SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                "INSERT INTO documents (collection, id, fields, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT (collection, id)
                 DO UPDATE SET fields = excluded.fields, updated_at = excluded.updated_at",
                params![collection, id, body, stamp],
            )?;
            tx.commit()?;
            Ok(!existed)
        })?;

        Ok((Document::new(id, fields), created))
    }

    /// Merge `patch` into the top-level fields of an existing document.
    pub fn update_document(
        &self,
        collection: &str,
        id: &str,
        mut patch: Map<String, Value>,
    ) -> Result<Document> {
        let now = Utc::now();
        ServerTimestamp::resolve_sentinels(&mut patch, now);
        let stamp = ServerTimestamp::format(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut doc = query_document(&tx, collection, id)?.ok_or_else(|| DbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
            doc.fields.extend(patch);
            tx.execute(
                "UPDATE documents SET fields = ?3, updated_at = ?4
                 WHERE collection = ?1 AND id = ?2",
                params![collection, id, serde_json::to_string(&doc.fields)?, stamp],
            )?;
            tx.commit()?;
            Ok(doc)
        })
    }

    /// Add `values` to the array `field`, skipping ones already present,
    /// within one transaction. A missing field counts as an empty array.
    pub fn array_union(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        values: Vec<Value>,
    ) -> Result<Document> {
        let stamp = ServerTimestamp::format(Utc::now());

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut doc = query_document(&tx, collection, id)?.ok_or_else(|| DbError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

            let entry = doc
                .fields
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = entry else {
                return Err(DbError::NotAnArray {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    field: field.to_string(),
                });
            };
            for value in values {
                if !items.contains(&value) {
                    items.push(value);
                }
            }

            tx.execute(
                "UPDATE documents SET fields = ?3, updated_at = ?4
                 WHERE collection = ?1 AND id = ?2",
                params![collection, id, serde_json::to_string(&doc.fields)?, stamp],
            )?;
            tx.commit()?;
            Ok(doc)
        })
    }

    /// Returns whether a document was removed.
    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
            Ok(removed > 0)
        })
    }
}

fn query_document(conn: &Connection, collection: &str, id: &str) -> Result<Option<Document>> {
    let row = conn
        .query_row(
            "SELECT id, fields FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    fields: row.get(1)?,
                })
            },
        )
        .optional()?;

    row.map(DocumentRow::into_document).transpose()
}

fn sql_key(key: &SortKey) -> Option<SqlValue> {
    match key {
        SortKey::Number(n) => Some(SqlValue::Real(*n)),
        SortKey::Text(s) => Some(SqlValue::Text(s.clone())),
        // Stored documents are always resolved, so nothing sorts after this.
        SortKey::Pending => None,
    }
}

fn query_page(
    conn: &Connection,
    query: &QueryDescriptor,
    after: Option<&Cursor>,
    limit: Option<u32>,
) -> Result<Vec<Document>> {
    let path = query.json_path();
    // SQLite treats a negative LIMIT as "no limit"
    let limit = limit.map(i64::from).unwrap_or(-1);

    let rows = match after {
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, fields FROM documents
                 WHERE collection = ?1 AND {ORDERABLE}
                 ORDER BY json_extract(fields, ?2), id
                 LIMIT ?3"
            ))?;
            stmt.query_map(params![query.collection_path, path, limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        Some(cursor) => {
            let Some(key) = sql_key(&cursor.key) else {
                return Ok(vec![]);
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT id, fields FROM documents
                 WHERE collection = ?1 AND {ORDERABLE}
                   AND (json_extract(fields, ?2) > ?3
                        OR (json_extract(fields, ?2) = ?3 AND id > ?4))
                 ORDER BY json_extract(fields, ?2), id
                 LIMIT ?5"
            ))?;
            stmt.query_map(
                params![query.collection_path, path, key, cursor.id, limit],
                map_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    rows.into_iter().map(DocumentRow::into_document).collect()
}

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        id: row.get(0)?,
        fields: row.get(1)?,
    })
}
