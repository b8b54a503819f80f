//! CSV table database.
//!
//! A database is a directory `<Directory>/<Name>_<YYYY-MM-DDTHH-MM-SS>/`
//! holding one `<table>.csv` per table with the header `timestamp,value`.
//! Rotation starts a new directory stamped with the current local time.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::TableStore;
use crate::delivery::Timestamp;
use crate::error::{SentinelError, SentinelResult};

/// Header row of every table file.
pub const TABLE_HEADER: [&str; 2] = ["timestamp", "value"];

/// Directory name timestamp format.
const DATABASE_STAMP: &str = "%Y-%m-%dT%H-%M-%S";

struct OpenDatabase {
    path: PathBuf,
    writers: HashMap<String, csv::Writer<File>>,
}

/// Directory-per-database CSV store.
pub struct CsvDatabase {
    directory: PathBuf,
    name: String,
    tables: Vec<String>,
    current: Option<OpenDatabase>,
}

impl std::fmt::Debug for CsvDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvDatabase")
            .field("directory", &self.directory)
            .field("name", &self.name)
            .field("current", &self.current_path())
            .finish()
    }
}

impl CsvDatabase {
    /// Databases named `name_*` under `directory`.
    pub fn new(directory: impl AsRef<Path>, name: &str) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            name: name.to_string(),
            tables: Vec::new(),
            current: None,
        }
    }

    /// Directory of the open database.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|db| db.path.as_path())
    }

    fn next_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format(DATABASE_STAMP).to_string();
        let base = self.directory.join(format!("{}_{stamp}", self.name));
        if !base.exists() {
            return base;
        }
        // Rotated twice within one second.
        (1u32..)
            .map(|n| self.directory.join(format!("{}_{stamp}_{n}", self.name)))
            .find(|candidate| !candidate.exists())
            .unwrap_or(base)
    }

    fn open_database(&self) -> SentinelResult<OpenDatabase> {
        let path = self.next_path();
        fs::create_dir_all(&path)?;
        let mut db = OpenDatabase {
            path,
            writers: HashMap::new(),
        };
        for table in &self.tables {
            db.writers.insert(table.clone(), open_table(&db.path, table)?);
        }
        info!(path = %db.path.display(), tables = self.tables.len(), "Opened database");
        Ok(db)
    }

    fn commit_current(&mut self) -> SentinelResult<()> {
        if let Some(db) = self.current.as_mut() {
            for writer in db.writers.values_mut() {
                writer.flush()?;
            }
        }
        Ok(())
    }
}

fn open_table(dir: &Path, table: &str) -> SentinelResult<csv::Writer<File>> {
    let path = dir.join(format!("{table}.csv"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let empty = file.metadata()?.len() == 0;
    let mut writer = csv::Writer::from_writer(file);
    if empty {
        writer.write_record(TABLE_HEADER)?;
        writer.flush()?;
    }
    Ok(writer)
}

impl TableStore for CsvDatabase {
    fn create_tables(&mut self, tables: &[String]) -> SentinelResult<()> {
        self.tables = tables.to_vec();
        match self.current.as_mut() {
            Some(db) => {
                for table in tables {
                    if !db.writers.contains_key(table) {
                        let writer = open_table(&db.path, table)?;
                        db.writers.insert(table.clone(), writer);
                    }
                }
            }
            None => self.current = Some(self.open_database()?),
        }
        Ok(())
    }

    fn append(&mut self, table: &str, rows: &[(Timestamp, f64)]) -> SentinelResult<()> {
        let db = self
            .current
            .as_mut()
            .ok_or_else(|| SentinelError::Storage("no database is open".into()))?;
        let writer = db
            .writers
            .get_mut(table)
            .ok_or_else(|| SentinelError::Storage(format!("unknown table '{table}'")))?;
        for (timestamp, value) in rows {
            writer.write_record(&[timestamp.as_secs().to_string(), value.to_string()])?;
        }
        Ok(())
    }

    fn commit(&mut self) -> SentinelResult<()> {
        self.commit_current()
    }

    fn rotate(&mut self) -> SentinelResult<()> {
        self.commit_current()?;
        let next = self.open_database()?;
        if let Some(previous) = self.current.replace(next) {
            debug!(path = %previous.path.display(), "Closed database");
        }
        Ok(())
    }

    fn close(&mut self) -> SentinelResult<()> {
        self.commit_current()?;
        if let Some(db) = self.current.take() {
            info!(path = %db.path.display(), "Closed database");
        }
        Ok(())
    }
}
