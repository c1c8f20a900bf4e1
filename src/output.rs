//! Time series output.
//!
//! Each quantity gets its own subdirectory of the output root,
//! with one JSON record per time step:
//!
//! ```text
//! results/
//!   u/u_000001.json
//!   u/u_000002.json
//!   E/E_000001.json
//!   ...
//! ```
//!
//! Records are written to a temporary file in the same directory
//! and renamed into place, so readers never see a partial record.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Error in writing or reading output files.
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    /// Filesystem operation failed.
    #[error("Output I/O failed")]
    Io(#[from] std::io::Error),
    /// A record couldn't be (de)serialized.
    #[error("Malformed output record")]
    Json(#[from] serde_json::Error),
    /// Moving a finished record into place failed.
    #[error("Failed to move record into place")]
    Persist(#[from] tempfile::PersistError),
}

/// One time step of one quantity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    /// Name of the quantity.
    pub name: String,
    /// Time stamp of the step.
    pub time: f64,
    /// The values, e.g. one vector per vertex.
    pub values: T,
}

/// Per-segment values of a quantity, one map per evaluation.
pub type SegmentHistory = Vec<BTreeMap<u32, Vec<f64>>>;

/// Writes records of named quantities under a root directory.
#[derive(Clone, Debug)]
pub struct TimeSeriesWriter {
    root: PathBuf,
}

impl TimeSeriesWriter {
    /// Create a writer, creating the root directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The root directory.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record of `name` at `index`.
    pub fn record_path(&self, name: &str, index: usize) -> PathBuf {
        self.root.join(name).join(format!("{name}_{index:06}.json"))
    }

    /// Write one record, replacing any previous record with the same index.
    pub fn write<T: Serialize>(
        &self,
        name: &str,
        index: usize,
        time: f64,
        values: &T,
    ) -> Result<PathBuf, OutputError> {
        std::fs::create_dir_all(self.root.join(name))?;
        let path = self.record_path(name, index);
        write_json_atomic(
            &path,
            &Record {
                name: name.to_string(),
                time,
                values,
            },
        )?;
        tracing::trace!(path = %path.display(), "wrote record");
        Ok(path)
    }
}

/// Serialize a value to a JSON file atomically.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OutputError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = std::io::BufWriter::new(&mut tmp);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.persist(path)?;
    Ok(())
}

/// Read every record of a quantity, ordered by time.
///
/// Files in the quantity's directory that aren't records of it are ignored.
pub fn read_series<T: DeserializeOwned>(
    root: impl AsRef<Path>,
    name: &str,
) -> Result<Vec<Record<T>>, OutputError> {
    let dir = root.as_ref().join(name);
    let prefix = format!("{name}_");
    let mut records = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_record = path.extension().is_some_and(|e| e == "json")
            && path
                .file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.starts_with(&prefix));
        if !is_record {
            continue;
        }
        let file = std::fs::File::open(&path)?;
        let record: Record<T> = serde_json::from_reader(std::io::BufReader::new(file))?;
        records.push(record);
    }
    records.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(records)
}

/// Read a segment history written with [`write_json_atomic`].
pub fn read_segment_history(path: impl AsRef<Path>) -> Result<SegmentHistory, OutputError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_read_back_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TimeSeriesWriter::new(dir.path().join("results")).unwrap();
        for (index, time) in [(3, 3.), (1, 1.), (2, 2.)] {
            writer
                .write("activation", index, time, &vec![time * 10.; 4])
                .unwrap();
        }
        // unrelated files are skipped
        std::fs::write(writer.root().join("activation").join("notes.txt"), "hi").unwrap();

        let records: Vec<Record<Vec<f64>>> = read_series(writer.root(), "activation").unwrap();
        let times: Vec<f64> = records.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![1., 2., 3.]);
        assert_eq!(records[1].values, vec![20.; 4]);
        assert_eq!(records[0].name, "activation");
    }

    #[test]
    fn record_paths_are_per_quantity() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TimeSeriesWriter::new(dir.path()).unwrap();
        let path = writer.write("u", 7, 7., &[[0., 1., 2.]]).unwrap();
        assert_eq!(path, dir.path().join("u").join("u_000007.json"));
        assert!(path.exists());
        // no temporary files left behind
        let entries = std::fs::read_dir(dir.path().join("u")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn rewriting_a_record_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TimeSeriesWriter::new(dir.path()).unwrap();
        writer.write("E", 1, 1., &vec![1.]).unwrap();
        writer.write("E", 1, 1., &vec![2.]).unwrap();
        let records: Vec<Record<Vec<f64>>> = read_series(dir.path(), "E").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].values, vec![2.]);
    }

    #[test]
    fn segment_history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fiber_strain.json");
        let history: SegmentHistory = vec![
            BTreeMap::from([(1, vec![0.1, 0.2]), (2, vec![0.3])]),
            BTreeMap::from([(1, vec![0.15, 0.25]), (2, vec![0.35])]),
        ];
        write_json_atomic(&path, &history).unwrap();
        assert_eq!(read_segment_history(&path).unwrap(), history);
    }

    #[test]
    fn missing_series_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_series::<Vec<f64>>(dir.path(), "u"),
            Err(OutputError::Io(_))
        ));
    }
}
