//! Authoritative map of migration progress per table.
//!
//! Published once by the Start update and mutated table-by-table by
//! TableUpdate. Readers get owned copies; no reference to a replaced entry
//! survives the replacing call.

use std::sync::Mutex;

use passage_updates::{MigrationStatus, Step, Table};

#[derive(Default)]
pub struct TableRegistry {
    status: Mutex<Option<MigrationStatus>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the status carried by the Start update. The first publish
    /// wins; repeated publishes are rejected so queues and workers are
    /// created exactly once.
    pub fn publish(&self, status: MigrationStatus) -> bool {
        let Ok(mut guard) = self.status.lock() else {
            return false;
        };
        if guard.is_some() {
            return false;
        }
        *guard = Some(status);
        true
    }

    pub fn is_published(&self) -> bool {
        self.status.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Atomically replace one table's entry.
    pub fn set_table(&self, table: Table) {
        if let Ok(mut guard) = self.status.lock() {
            if let Some(status) = guard.as_mut() {
                status
                    .tables
                    .entry(table.keyspace.clone())
                    .or_default()
                    .insert(table.name.clone(), table);
            }
        }
    }

    pub fn step(&self, keyspace: &str, table: &str) -> Option<Step> {
        self.status.lock().ok().and_then(|guard| {
            guard
                .as_ref()?
                .tables
                .get(keyspace)?
                .get(table)
                .map(|entry| entry.step)
        })
    }

    pub fn contains_keyspace(&self, keyspace: &str) -> bool {
        self.status
            .lock()
            .ok()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|status| status.tables.contains_key(keyspace))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Option<MigrationStatus> {
        self.status.lock().ok().and_then(|guard| guard.clone())
    }
}
