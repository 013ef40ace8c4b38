use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

type Table = Arc<DashMap<String, i64>>;

/// In-process counter buffer with the same semantics as the Redis backend.
///
/// Uses `DashMap` per table so concurrent increments on different keys
/// never contend. Increments hold the table-set read lock for their whole
/// duration and renames take the write lock, so no increment can land in
/// a table after it has been renamed away.
#[derive(Default)]
pub struct MemoryCounterStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `amount` to `key` in table `name`, creating both as needed.
    pub fn increment(&self, name: &str, key: &str, amount: i64) -> i64 {
        {
            let tables = self.tables.read();
            if let Some(table) = tables.get(name) {
                return add(table, key, amount);
            }
        }

        let mut tables = self.tables.write();
        let table = tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashMap::with_capacity(64)));
        add(table, key, amount)
    }

    /// Number of entries in table `name`.
    pub fn len(&self, name: &str) -> u64 {
        self.tables
            .read()
            .get(name)
            .map_or(0, |table| table.len() as u64)
    }

    /// Whether table `name` is present. Tables are never created empty and
    /// are dropped whole, so presence matches Redis, which removes empty
    /// hashes.
    pub fn exists(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Renames `from` to `to` unless `to` already exists.
    ///
    /// Returns false when `from` is missing or `to` is taken.
    pub fn rename_nx(&self, from: &str, to: &str) -> bool {
        let mut tables = self.tables.write();
        if tables.contains_key(to) {
            return false;
        }
        match tables.remove(from) {
            Some(table) => {
                tables.insert(to.to_string(), table);
                true
            }
            None => false,
        }
    }

    /// Returns up to `count` entries starting at offset `cursor`, plus the
    /// next cursor (0 when iteration is complete).
    ///
    /// Only meaningful for tables that no longer receive writes, which is
    /// the case for drained tables.
    pub fn scan(&self, name: &str, cursor: u64, count: usize) -> (u64, Vec<(String, i64)>) {
        let Some(table) = self.tables.read().get(name).cloned() else {
            return (0, Vec::new());
        };

        let offset = usize::try_from(cursor).unwrap_or(usize::MAX);
        let count = count.max(1);
        let entries: Vec<(String, i64)> = table
            .iter()
            .skip(offset)
            .take(count)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        let next = offset + entries.len();
        if entries.len() < count || next >= table.len() {
            (0, entries)
        } else {
            (next as u64, entries)
        }
    }

    /// Removes table `name`. Returns whether it existed.
    pub fn delete(&self, name: &str) -> bool {
        self.tables.write().remove(name).is_some()
    }
}

fn add(table: &DashMap<String, i64>, key: &str, amount: i64) -> i64 {
    if let Some(mut value) = table.get_mut(key) {
        *value = value.saturating_add(amount);
        return *value;
    }
    let mut value = table.entry(key.to_string()).or_insert(0);
    *value = value.saturating_add(amount);
    *value
}
