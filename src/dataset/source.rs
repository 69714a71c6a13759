//! Sources that can provide a contiguous range of rows from a named,
//! rectangular, numeric dataset.
use crate::error::DataAccessError;
use csv::ReaderBuilder;
use ndarray::{s, Array2};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A named-dataset reader that can be asked for a contiguous row range.
///
/// Implementations must be safe to share between tasks since a `Dataset`
/// holds its source behind an `Arc`.
pub trait RowSource: Send + Sync {
    /// The total number of rows in the dataset called `name`. This is
    /// metadata and must not depend on which rank asks.
    fn total_rows(&self, name: &str) -> Result<u64, DataAccessError>;

    /// Reads exactly `count` rows of `name` starting at global row `offset`.
    fn read_rows(
        &self,
        name: &str,
        offset: u64,
        count: u64,
    ) -> Result<Array2<f64>, DataAccessError>;
}

/// A `RowSource` backed by arrays already held in memory. Every rank of an
/// in-process group can share one `MemorySource`.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    datasets: HashMap<String, Array2<f64>>,
}

impl MemorySource {
    pub fn new() -> Self {
        MemorySource::default()
    }

    /// Adds (or replaces) the dataset called `name`
    pub fn with_dataset(mut self, name: &str, data: Array2<f64>) -> Self {
        self.datasets.insert(name.to_string(), data);
        self
    }

    fn get(&self, name: &str) -> Result<&Array2<f64>, DataAccessError> {
        self.datasets
            .get(name)
            .ok_or_else(|| DataAccessError::NotFound(name.to_string()))
    }
}

impl RowSource for MemorySource {
    fn total_rows(&self, name: &str) -> Result<u64, DataAccessError> {
        Ok(self.get(name)?.nrows() as u64)
    }

    fn read_rows(
        &self,
        name: &str,
        offset: u64,
        count: u64,
    ) -> Result<Array2<f64>, DataAccessError> {
        let data = self.get(name)?;
        let n_rows = data.nrows() as u64;
        let end = offset.saturating_add(count);
        if end > n_rows {
            return Err(DataAccessError::ShortRead {
                offset,
                expected: count,
                got: n_rows.saturating_sub(offset),
            });
        }
        Ok(data.slice(s![offset as usize..end as usize, ..]).to_owned())
    }
}

/// A `RowSource` that reads comma separated files from a directory, where
/// the dataset `name` lives in `<dir>/<name>.csv`. Every field must parse as
/// a float.
#[derive(Debug, Clone)]
pub struct CsvSource {
    dir: PathBuf,
    has_headers: bool,
}

impl CsvSource {
    /// Creates a source for headerless files in `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        CsvSource {
            dir: dir.as_ref().to_path_buf(),
            has_headers: false,
        }
    }

    /// Whether the first line of each file is a header to be skipped
    pub fn has_headers(mut self, yes: bool) -> Self {
        self.has_headers = yes;
        self
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", name))
    }

    fn reader(
        &self,
        name: &str,
    ) -> Result<csv::Reader<std::fs::File>, DataAccessError> {
        let path = self.path(name);
        if !path.is_file() {
            return Err(DataAccessError::NotFound(name.to_string()));
        }
        Ok(ReaderBuilder::new()
            .has_headers(self.has_headers)
            .from_path(path)?)
    }
}

impl RowSource for CsvSource {
    fn total_rows(&self, name: &str) -> Result<u64, DataAccessError> {
        let mut reader = self.reader(name)?;
        let mut n = 0;
        for record in reader.records() {
            record?;
            n += 1;
        }
        Ok(n)
    }

    fn read_rows(
        &self,
        name: &str,
        offset: u64,
        count: u64,
    ) -> Result<Array2<f64>, DataAccessError> {
        let mut reader = self.reader(name)?;
        let mut values = Vec::new();
        let mut n_cols = None;
        let mut got = 0;
        for record in reader
            .records()
            .skip(offset as usize)
            .take(count as usize)
        {
            let record = record?;
            match n_cols {
                None => n_cols = Some(record.len()),
                Some(n) if n != record.len() => {
                    return Err(DataAccessError::Malformed(format!(
                        "row {} has {} fields, expected {}",
                        offset + got,
                        record.len(),
                        n
                    )))
                }
                Some(_) => (),
            }
            for field in record.iter() {
                let v: f64 = field.trim().parse().map_err(|_| {
                    DataAccessError::Malformed(format!(
                        "`{}` in row {} is not a number",
                        field,
                        offset + got
                    ))
                })?;
                values.push(v);
            }
            got += 1;
        }
        if got < count {
            return Err(DataAccessError::ShortRead {
                offset,
                expected: count,
                got,
            });
        }
        let n_cols = n_cols.unwrap_or(0);
        Array2::from_shape_vec((got as usize, n_cols), values)
            .map_err(|e| DataAccessError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_memory_source_range() {
        let src = MemorySource::new()
            .with_dataset("d", array![[0.0], [1.0], [2.0], [3.0]]);
        assert_eq!(src.total_rows("d").unwrap(), 4);
        let rows = src.read_rows("d", 1, 2).unwrap();
        assert_eq!(rows, array![[1.0], [2.0]]);
        assert!(matches!(
            src.read_rows("d", 3, 2),
            Err(DataAccessError::ShortRead { got: 1, .. })
        ));
        assert!(matches!(
            src.total_rows("missing"),
            Err(DataAccessError::NotFound(_))
        ));
    }

    #[test]
    fn test_csv_source() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join("rows.csv")).unwrap();
        writeln!(f, "a,b").unwrap();
        for i in 0..5 {
            writeln!(f, "{},{}", i, i * 10).unwrap();
        }
        drop(f);

        let src = CsvSource::new(dir.path()).has_headers(true);
        assert_eq!(src.total_rows("rows").unwrap(), 5);
        let rows = src.read_rows("rows", 2, 2).unwrap();
        assert_eq!(rows, array![[2.0, 20.0], [3.0, 30.0]]);
        assert!(matches!(
            src.read_rows("rows", 4, 3),
            Err(DataAccessError::ShortRead { got: 1, .. })
        ));
        assert!(matches!(
            src.read_rows("nope", 0, 1),
            Err(DataAccessError::NotFound(_))
        ));
    }

    #[test]
    fn test_csv_malformed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "1,2\n3,x\n").unwrap();
        let src = CsvSource::new(dir.path());
        assert!(matches!(
            src.read_rows("bad", 0, 2),
            Err(DataAccessError::Malformed(_))
        ));
    }
}
