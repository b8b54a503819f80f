//! In-memory table store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::TableStore;
use crate::delivery::Timestamp;
use crate::error::{SentinelError, SentinelResult};

/// One database: table -> `(timestamp, value)` rows in append order.
pub type MemoryDatabase = BTreeMap<String, Vec<(f64, f64)>>;

#[derive(Debug, Default)]
struct MemoryState {
    databases: Vec<MemoryDatabase>,
    commits: u64,
    closed: bool,
    fail_appends: bool,
}

/// Shared-handle store; clones observe the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every database created so far, oldest first.
    pub fn databases(&self) -> Vec<MemoryDatabase> {
        self.state.lock().databases.clone()
    }

    /// Rows of `table` in the current database.
    pub fn rows(&self, table: &str) -> Vec<(f64, f64)> {
        self.state
            .lock()
            .databases
            .last()
            .and_then(|db| db.get(table).cloned())
            .unwrap_or_default()
    }

    /// Commits so far.
    pub fn commits(&self) -> u64 {
        self.state.lock().commits
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Make appends fail until switched off again.
    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().fail_appends = fail;
    }
}

impl TableStore for MemoryStore {
    fn create_tables(&mut self, tables: &[String]) -> SentinelResult<()> {
        let mut state = self.state.lock();
        state.closed = false;
        if state.databases.is_empty() {
            state.databases.push(MemoryDatabase::new());
        }
        if let Some(db) = state.databases.last_mut() {
            for table in tables {
                db.entry(table.clone()).or_default();
            }
        }
        Ok(())
    }

    fn append(&mut self, table: &str, rows: &[(Timestamp, f64)]) -> SentinelResult<()> {
        let mut state = self.state.lock();
        if state.fail_appends {
            return Err(SentinelError::Storage("simulated append failure".into()));
        }
        let db = state
            .databases
            .last_mut()
            .ok_or_else(|| SentinelError::Storage("no database is open".into()))?;
        let table = db
            .get_mut(table)
            .ok_or_else(|| SentinelError::Storage(format!("unknown table '{table}'")))?;
        table.extend(rows.iter().map(|(t, v)| (t.as_secs(), *v)));
        Ok(())
    }

    fn commit(&mut self) -> SentinelResult<()> {
        self.state.lock().commits += 1;
        Ok(())
    }

    fn rotate(&mut self) -> SentinelResult<()> {
        let mut state = self.state.lock();
        let tables: MemoryDatabase = state
            .databases
            .last()
            .map(|db| db.keys().map(|k| (k.clone(), Vec::new())).collect())
            .unwrap_or_default();
        state.databases.push(tables);
        Ok(())
    }

    fn close(&mut self) -> SentinelResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
