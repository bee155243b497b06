//! Flat on-disk record store.
//!
//! Records are persisted in their wire layout, one file per node. Writes go
//! to a temporary sibling first and are renamed into place, so a reader never
//! observes a partially written record.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Fault, FaultKind};
use crate::node::NodeName;
use crate::record::StatusRecord;
use crate::wire;

/// File extension of persisted records.
pub const RECORD_EXTENSION: &str = "rec";

/// Errors raised while saving a record.
#[derive(Error, Debug)]
#[error("cannot write record {path}: {source}")]
pub struct StoreError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl StoreError {
    pub fn kind(&self) -> FaultKind {
        FaultKind::Io
    }
}

impl From<StoreError> for Fault {
    fn from(err: StoreError) -> Self {
        Fault::new(err.kind(), err.to_string())
    }
}

/// Path of the record file for `name` inside `dir`.
pub fn record_path(dir: &Path, name: &NodeName) -> PathBuf {
    dir.join(format!("{name}.{RECORD_EXTENSION}"))
}

/// Atomically writes `record` to `path`, creating parent directories.
pub fn save_record(path: &Path, record: &StatusRecord) -> Result<(), StoreError> {
    let err = |source| StoreError {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
    std::fs::write(&tmp, wire::encode(record)).map_err(err)?;
    std::fs::rename(&tmp, path).map_err(err)?;

    debug!(path = %path.display(), "Saved status record");
    Ok(())
}

/// Loads a record from `path`.
///
/// Returns `None` if the file is absent or does not hold a valid record; a
/// corrupt file is logged and ignored.
pub fn load_record(path: &Path) -> Option<StatusRecord> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read status record");
            return None;
        }
    };
    match wire::decode(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt status record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{NodeState, PublishableStatus, RecordKind};

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let name = NodeName::new("HV_ARICH").unwrap();
        let path = record_path(dir.path(), &name);

        let mut record = StatusRecord::allocate(RecordKind::Hv, 4).unwrap();
        record.set_state(NodeState::Ready);
        record.set_config_id(17);

        save_record(&path, &record).unwrap();
        assert_eq!(load_record(&path), Some(record));
        assert!(path.ends_with("HV_ARICH.rec"));
    }

    #[test]
    fn test_save_creates_parent_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/node.rec");
        let record = StatusRecord::allocate(RecordKind::Readout, 1).unwrap();

        save_record(&path, &record).unwrap();
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_record(&dir.path().join("absent.rec")), None);
    }

    #[test]
    fn test_load_corrupt_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rec");
        std::fs::write(&path, b"garbage").unwrap();
        assert_eq!(load_record(&path), None);
    }
}
