//! Read-only summary of recorded databases.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SentinelError, SentinelResult};

/// Summary of one table file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSummary {
    /// Table name
    pub name: String,
    /// Readable rows
    pub rows: u64,
    /// Rows that could not be parsed
    pub corrupt_rows: u64,
    /// Earliest timestamp
    pub first_timestamp: Option<f64>,
    /// Latest timestamp
    pub last_timestamp: Option<f64>,
    /// Smallest value
    pub min_value: Option<f64>,
    /// Largest value
    pub max_value: Option<f64>,
}

/// Summary of one database directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSummary {
    /// Database directory
    pub path: PathBuf,
    /// Tables, by name
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Deserialize)]
struct Row {
    timestamp: f64,
    value: f64,
}

fn fold_min(current: Option<f64>, value: f64) -> Option<f64> {
    Some(current.map_or(value, |c| c.min(value)))
}

fn fold_max(current: Option<f64>, value: f64) -> Option<f64> {
    Some(current.map_or(value, |c| c.max(value)))
}

fn summarize_table(path: &Path) -> SentinelResult<TableSummary> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut summary = TableSummary {
        name,
        rows: 0,
        corrupt_rows: 0,
        first_timestamp: None,
        last_timestamp: None,
        min_value: None,
        max_value: None,
    };

    let mut reader = csv::Reader::from_path(path)?;
    for record in reader.deserialize::<Row>() {
        match record {
            Ok(row) if row.timestamp.is_finite() && row.value.is_finite() => {
                summary.rows += 1;
                summary.first_timestamp = fold_min(summary.first_timestamp, row.timestamp);
                summary.last_timestamp = fold_max(summary.last_timestamp, row.timestamp);
                summary.min_value = fold_min(summary.min_value, row.value);
                summary.max_value = fold_max(summary.max_value, row.value);
            }
            _ => summary.corrupt_rows += 1,
        }
    }
    Ok(summary)
}

fn csv_files(dir: &Path) -> SentinelResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    files.sort();
    Ok(files)
}

fn summarize_database(dir: &Path) -> SentinelResult<DatabaseSummary> {
    let tables = csv_files(dir)?
        .iter()
        .map(|file| summarize_table(file))
        .collect::<SentinelResult<Vec<_>>>()?;
    Ok(DatabaseSummary {
        path: dir.to_path_buf(),
        tables,
    })
}

/// Summarize the database at `base`, or every database directly below it.
pub fn inspect(base: impl AsRef<Path>) -> SentinelResult<Vec<DatabaseSummary>> {
    let base = base.as_ref();
    if !base.is_dir() {
        return Err(SentinelError::Storage(format!(
            "'{}' is not a directory",
            base.display()
        )));
    }
    if !csv_files(base)?.is_empty() {
        return Ok(vec![summarize_database(base)?]);
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(base)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut summaries = Vec::new();
    for dir in dirs {
        if !csv_files(&dir)?.is_empty() {
            summaries.push(summarize_database(&dir)?);
        }
    }
    Ok(summaries)
}

impl fmt::Display for DatabaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.path.display())?;
        for table in &self.tables {
            write!(f, "  {:<32} {:>10} rows", table.name, table.rows)?;
            if let (Some(first), Some(last)) = (table.first_timestamp, table.last_timestamp) {
                write!(f, "  span {:.3} s", last - first)?;
            }
            if let (Some(min), Some(max)) = (table.min_value, table.max_value) {
                write!(f, "  range [{min:.6}, {max:.6}]")?;
            }
            if table.corrupt_rows > 0 {
                write!(f, "  ({} corrupt)", table.corrupt_rows)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn write_db(base: &Path, name: &str, tables: &[(&str, &str)]) -> PathBuf {
        let dir = base.join(name);
        fs::create_dir(&dir).unwrap();
        for (table, body) in tables {
            fs::write(dir.join(format!("{table}.csv")), body).unwrap();
        }
        dir
    }

    #[test]
    fn summarizes_every_database_below_base() {
        let base = tempfile::tempdir().unwrap();
        write_db(
            base.path(),
            "rig_2024-01-01T00-00-00",
            &[("open_sum", "timestamp,value\n10.0,1.5\n12.5,-2\n11.0,4\n")],
        );
        write_db(
            base.path(),
            "rig_2024-01-02T00-00-00",
            &[("open_sum", "timestamp,value\n")],
        );
        fs::create_dir(base.path().join("unrelated")).unwrap();

        let summaries = inspect(base.path()).unwrap();
        assert_eq!(summaries.len(), 2);

        let table = &summaries[0].tables[0];
        assert_eq!(table.name, "open_sum");
        assert_eq!(table.rows, 3);
        assert_relative_eq!(table.first_timestamp.unwrap(), 10.0);
        assert_relative_eq!(table.last_timestamp.unwrap(), 12.5);
        assert_relative_eq!(table.min_value.unwrap(), -2.0);
        assert_relative_eq!(table.max_value.unwrap(), 4.0);

        assert_eq!(summaries[1].tables[0].rows, 0);
        assert_eq!(summaries[1].tables[0].first_timestamp, None);
    }

    #[test]
    fn corrupt_rows_are_counted_not_fatal() {
        let base = tempfile::tempdir().unwrap();
        let db = write_db(
            base.path(),
            "rig",
            &[("t", "timestamp,value\n1,1\nnot-a-number,2\n3,NaN\n4,4\n")],
        );

        let summaries = inspect(&db).unwrap();
        assert_eq!(summaries.len(), 1);
        let table = &summaries[0].tables[0];
        assert_eq!(table.rows, 2);
        assert_eq!(table.corrupt_rows, 2);
        assert!(summaries[0].to_string().contains("2 corrupt"));
    }

    #[test]
    fn missing_base_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        assert!(inspect(base.path().join("absent")).is_err());
    }
}
