use std::collections::HashSet;

use tracing::{debug, warn};

use writedown_types::{Cursor, Document, DocumentChange, QueryDescriptor};

/// What applying a live change did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Removed,
    /// Sorts after the loaded range; it will arrive with a later page.
    Deferred,
    /// Nothing to do (removal of an unknown id, unorderable document).
    Ignored,
}

impl Applied {
    /// Whether the visible window differs afterwards.
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Removed)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    pos: Cursor,
    doc: Document,
}

/// The loaded, ordered prefix of a collection.
///
/// Items are kept sorted by `(order value, id)`. `edge` is the position of
/// the last item that came from a page fetch; it is the cursor for the next
/// page and is never derived from a live change. Live changes are accepted
/// only up to the edge, except once the window is exhausted (the last page
/// was short) and therefore holds the whole collection.
#[derive(Debug, Clone)]
pub struct Window {
    query: QueryDescriptor,
    entries: Vec<Entry>,
    edge: Option<Cursor>,
    exhausted: bool,
}

impl Window {
    pub fn new(query: QueryDescriptor) -> Self {
        Self {
            query,
            entries: Vec::new(),
            edge: None,
            exhausted: false,
        }
    }

    pub fn query(&self) -> &QueryDescriptor {
        &self.query
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Cursor for the next page.
    pub fn edge(&self) -> Option<&Cursor> {
        self.edge.as_ref()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.entries.iter().map(|e| &e.doc)
    }

    pub fn snapshot(&self) -> Vec<Document> {
        self.documents().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of(id).is_some()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.doc.id == id)
    }

    fn in_range(&self, pos: &Cursor) -> bool {
        self.exhausted || self.edge.as_ref().is_some_and(|edge| pos <= edge)
    }

    fn insert_sorted(&mut self, pos: Cursor, doc: Document) {
        let at = self.entries.partition_point(|e| e.pos < pos);
        self.entries.insert(at, Entry { pos, doc });
    }

    /// Append a fetched page. Documents already present keep their current
    /// version. Returns how many were added.
    pub fn extend(&mut self, page: Vec<Document>) -> usize {
        let fetched = page.len();
        let mut added = 0;

        for doc in page {
            let Some(pos) = self.query.position(&doc) else {
                warn!("page returned unorderable document {}", doc.id);
                continue;
            };
            if self.edge.as_ref().is_some_and(|edge| pos <= *edge) {
                warn!("page returned {} at or before the cursor; skipping", doc.id);
                continue;
            }
            self.edge = Some(pos.clone());
            if self.contains(&doc.id) {
                debug!("dropping duplicate {} from page", doc.id);
                continue;
            }
            self.insert_sorted(pos, doc);
            added += 1;
        }

        self.exhausted = fetched < self.query.page_size as usize;
        added
    }

    /// Replace the contents with the complete collection.
    pub fn load_all(&mut self, docs: Vec<Document>) -> usize {
        self.entries.clear();
        self.edge = None;
        for doc in docs {
            match self.query.position(&doc) {
                Some(pos) => {
                    if self.edge.as_ref().is_none_or(|edge| pos > *edge) {
                        self.edge = Some(pos.clone());
                    }
                    self.insert_sorted(pos, doc);
                }
                None => warn!("skipping unorderable document {}", doc.id),
            }
        }
        self.exhausted = true;
        self.entries.len()
    }

    /// Merge one live change in place.
    pub fn apply(&mut self, change: DocumentChange) -> Applied {
        match change {
            DocumentChange::Removed { id } => match self.index_of(&id) {
                Some(i) => {
                    self.entries.remove(i);
                    Applied::Removed
                }
                None => Applied::Ignored,
            },
            DocumentChange::Added(doc) | DocumentChange::Modified(doc) => self.upsert(doc),
        }
    }

    fn upsert(&mut self, doc: Document) -> Applied {
        let existing = self.index_of(&doc.id).map(|i| self.entries.remove(i));

        let Some(pos) = self.query.position(&doc) else {
            // No longer part of the ordered collection.
            return if existing.is_some() {
                Applied::Removed
            } else {
                Applied::Ignored
            };
        };

        if !self.in_range(&pos) {
            // Moved past the edge: it leaves the window until paged in.
            return if existing.is_some() {
                Applied::Removed
            } else {
                Applied::Deferred
            };
        }

        self.insert_sorted(pos, doc);
        if existing.is_some() {
            Applied::Updated
        } else {
            Applied::Inserted
        }
    }

    /// Merge a snapshot: it is authoritative up to its last item, or for
    /// the whole collection when `exhaustive`. Returns whether anything
    /// changed.
    pub fn apply_snapshot(&mut self, items: Vec<Document>, exhaustive: bool) -> bool {
        let bound = if exhaustive {
            None
        } else {
            match items.last().and_then(|d| self.query.position(d)) {
                Some(pos) => Some(pos),
                None => return false,
            }
        };

        let present: HashSet<&str> = items.iter().map(|d| d.id.as_str()).collect();
        let before = self.entries.len();
        self.entries.retain(|e| {
            let covered = bound.as_ref().is_none_or(|b| e.pos <= *b);
            !covered || present.contains(e.doc.id.as_str())
        });
        let mut changed = self.entries.len() != before;

        for doc in items {
            let current = self.index_of(&doc.id).map(|i| &self.entries[i].doc);
            if current == Some(&doc) {
                continue;
            }
            changed |= self.upsert(doc).changed();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(n: u32) -> Document {
        Document::new(format!("{n:02}"), json!({ "n": n }).as_object().cloned().unwrap())
    }

    fn ids(w: &Window) -> Vec<u32> {
        w.documents().map(|d| d.fields["n"].as_u64().unwrap() as u32).collect()
    }

    fn window(page_size: u32) -> Window {
        Window::new(QueryDescriptor::new("items", "n", page_size))
    }

    #[test]
    fn pages_extend_and_exhaust() {
        let mut w = window(5);
        assert_eq!(w.extend((1..=5).map(item).collect()), 5);
        assert!(!w.is_exhausted());
        assert_eq!(w.edge().unwrap().id, "05");

        assert_eq!(w.extend((6..=7).map(item).collect()), 2);
        assert!(w.is_exhausted());
        assert_eq!(ids(&w), [1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn empty_first_page_is_exhausted() {
        let mut w = window(5);
        assert_eq!(w.extend(vec![]), 0);
        assert!(w.is_exhausted());
        assert!(w.edge().is_none());
    }

    #[test]
    fn removal_keeps_order() {
        let mut w = window(5);
        w.extend((1..=5).map(item).collect());
        assert_eq!(w.apply(DocumentChange::Removed { id: "03".into() }), Applied::Removed);
        assert_eq!(ids(&w), [1, 2, 4, 5]);
        assert_eq!(w.apply(DocumentChange::Removed { id: "03".into() }), Applied::Ignored);
    }

    #[test]
    fn inserts_past_edge_are_deferred_until_exhausted() {
        let mut w = window(5);
        w.extend([1, 2, 4, 5, 6].into_iter().map(item).collect());

        assert_eq!(w.apply(DocumentChange::Added(item(3))), Applied::Inserted);
        assert_eq!(w.apply(DocumentChange::Added(item(9))), Applied::Deferred);
        assert_eq!(ids(&w), [1, 2, 3, 4, 5, 6]);

        w.extend(vec![item(7)]);
        assert!(w.is_exhausted());
        assert_eq!(w.apply(DocumentChange::Added(item(9))), Applied::Inserted);
        assert_eq!(ids(&w), [1, 2, 3, 4, 5, 6, 7, 9]);
    }

    #[test]
    fn modify_moving_past_edge_leaves_window() {
        let mut w = window(3);
        w.extend((1..=3).map(item).collect());
        let moved = Document::new("02", json!({ "n": 50 }).as_object().cloned().unwrap());
        assert_eq!(w.apply(DocumentChange::Modified(moved)), Applied::Removed);
        assert_eq!(ids(&w), [1, 3]);
        // The cursor still points past the last fetched position.
        assert_eq!(w.edge().unwrap().id, "03");
    }

    #[test]
    fn duplicate_from_page_is_dropped() {
        let mut w = window(3);
        w.extend((1..=3).map(item).collect());

        // The server moved "02" past the edge; the page races the live change.
        let moved = Document::new("02", json!({ "n": 5 }).as_object().cloned().unwrap());
        assert_eq!(w.extend(vec![item(4), moved.clone(), item(6)]), 2);
        assert_eq!(w.len(), 5);
        assert_eq!(w.documents().filter(|d| d.id == "02").count(), 1);

        // The live change then lands and repositions it.
        assert_eq!(w.apply(DocumentChange::Modified(moved)), Applied::Updated);
        assert_eq!(ids(&w), [1, 3, 4, 5, 6]);
    }

    #[test]
    fn load_all_holds_whole_collection() {
        let mut w = window(2);
        assert_eq!(w.load_all(vec![item(3), item(1), item(2)]), 3);
        assert!(w.is_exhausted());
        assert_eq!(ids(&w), [1, 2, 3]);
        assert_eq!(w.apply(DocumentChange::Added(item(10))), Applied::Inserted);
    }

    #[test]
    fn snapshot_replaces_covered_range() {
        let mut w = window(5);
        w.extend((1..=5).map(item).collect());

        // Authoritative for 1..=4: item 2 is gone, item 3 changed.
        let mut changed3 = item(3);
        changed3.fields.insert("text".into(), json!("edited"));
        assert!(w.apply_snapshot(vec![item(1), changed3.clone(), item(4)], false));
        assert_eq!(ids(&w), [1, 3, 4, 5]);
        assert_eq!(w.documents().nth(1).unwrap(), &changed3);

        // Same snapshot again: nothing to do.
        assert!(!w.apply_snapshot(vec![item(1), changed3, item(4)], false));
    }

    #[test]
    fn exhaustive_snapshot_covers_everything() {
        let mut w = window(5);
        w.extend((1..=5).map(item).collect());
        assert!(w.apply_snapshot(vec![item(1), item(2)], true));
        assert_eq!(ids(&w), [1, 2]);
    }
}
