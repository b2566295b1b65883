// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory metadata store.
//!
//! Records live in a `BTreeMap` keyed by `(object_id, copy_id)`. The disown
//! index is a separate `BTreeSet<(disown_timestamp, object_id, copy_id)>`
//! holding only disowned rows, updated under the same lock as the primary
//! map so the two never disagree.

use super::MetadataStore;
use crate::blob::BoxFuture;
use crate::record::{CopyRecord, DisownOutcome};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

type Key = (String, String);

#[derive(Default)]
struct Tables {
    records: BTreeMap<Key, CopyRecord>,
    disown_index: BTreeSet<(i64, String, String)>,
}

impl Tables {
    fn index_entry(record: &CopyRecord) -> Option<(i64, String, String)> {
        match (record.is_disowned(), record.disown_timestamp) {
            (true, Some(ts)) => Some((ts, record.object_id.clone(), record.copy_id.clone())),
            _ => None,
        }
    }

    fn upsert(&mut self, record: CopyRecord) {
        let key = (record.object_id.clone(), record.copy_id.clone());
        let merged = match self.records.get(&key) {
            Some(existing) if existing.is_disowned() => CopyRecord {
                disown_status: existing.disown_status,
                disown_timestamp: existing.disown_timestamp,
                ..record
            },
            _ => record,
        };

        if let Some(old) = self.records.get(&key).and_then(Self::index_entry) {
            self.disown_index.remove(&old);
        }
        if let Some(entry) = Self::index_entry(&merged) {
            self.disown_index.insert(entry);
        }
        self.records.insert(key, merged);
    }

    fn remove(&mut self, key: &Key) -> bool {
        match self.records.remove(key) {
            Some(record) => {
                if let Some(entry) = Self::index_entry(&record) {
                    self.disown_index.remove(&entry);
                }
                true
            }
            None => false,
        }
    }
}

/// Metadata store held entirely in process memory.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<Tables>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records (all states).
    pub async fn len(&self) -> usize {
        self.tables.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of entries in the disown index.
    pub async fn disowned_count(&self) -> usize {
        self.tables.read().await.disown_index.len()
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn put(&self, record: CopyRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.tables.write().await.upsert(record);
            Ok(())
        })
    }

    fn get(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, Option<CopyRecord>> {
        let key = (object_id.to_string(), copy_id.to_string());
        Box::pin(async move { Ok(self.tables.read().await.records.get(&key).cloned()) })
    }

    fn delete(&self, object_id: &str, copy_id: &str) -> BoxFuture<'_, bool> {
        let key = (object_id.to_string(), copy_id.to_string());
        Box::pin(async move { Ok(self.tables.write().await.remove(&key)) })
    }

    fn disown(&self, object_id: &str, copy_id: &str, at: i64) -> BoxFuture<'_, DisownOutcome> {
        let key = (object_id.to_string(), copy_id.to_string());
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let record = match tables.records.get(&key) {
                None => return Ok(DisownOutcome::Absent),
                Some(record) if record.is_disowned() => return Ok(DisownOutcome::AlreadyDisowned),
                Some(record) => record.clone(),
            };
            tables.upsert(record.disowned_at(at));
            Ok(DisownOutcome::Disowned)
        })
    }

    fn copies_of(&self, object_id: &str) -> BoxFuture<'_, Vec<CopyRecord>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let tables = self.tables.read().await;
            let start = (object_id.clone(), String::new());
            Ok(tables
                .records
                .range(start..)
                .take_while(|((o, _), _)| *o == object_id)
                .map(|(_, r)| r.clone())
                .collect())
        })
    }

    fn query_disowned(&self, older_than: i64, limit: usize) -> BoxFuture<'_, Vec<CopyRecord>> {
        Box::pin(async move {
            let tables = self.tables.read().await;
            Ok(tables
                .disown_index
                .iter()
                .take_while(|(ts, _, _)| *ts < older_than)
                .take(limit)
                .filter_map(|(_, o, c)| tables.records.get(&(o.clone(), c.clone())).cloned())
                .collect())
        })
    }
}
