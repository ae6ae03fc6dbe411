// Database - RocksDB handle for per-node consensus state
//
// One key-value store per node directory. Safety-critical writes go through
// `put_sync`, which waits for the WAL to reach disk.
use rocksdb::{Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Database {
    db: Arc<DB>,
}

impl Database {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // a simulation opens one store per node, keep each one small
        opts.set_keep_log_file_num(5);
        opts.set_max_background_jobs(2);
        opts.set_recycle_log_file_num(2);

        let db = DB::open(&opts, path).map_err(|e| DatabaseError::OpenFailed(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.db.get(key).map_err(|e| DatabaseError::ReadFailed(e.to_string()))
    }

    /// Buffered write; may be lost on a crash
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.db
            .put(key, value)
            .map_err(|e| DatabaseError::WriteFailed(e.to_string()))
    }

    /// Write with a synced WAL; returns once the data survives a crash
    pub fn put_sync(&self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let mut batch = WriteBatch::default();
        batch.put(key, value);
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db
            .write_opt(batch, &opts)
            .map_err(|e| DatabaseError::WriteFailed(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("failed to open database: {0}")]
    OpenFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_key_reads_none() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        assert_eq!(db.get(b"absent").unwrap(), None);

        db.put(b"key", b"value").unwrap();
        assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn test_put_sync_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = Database::open(temp_dir.path()).unwrap();
            db.put_sync(b"k", b"v1").unwrap();
            db.put_sync(b"k", b"v2").unwrap();
        }
        let db = Database::open(temp_dir.path()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_second_open_of_same_path_fails() {
        let temp_dir = TempDir::new().unwrap();
        let _db = Database::open(temp_dir.path()).unwrap();
        assert!(matches!(
            Database::open(temp_dir.path()),
            Err(DatabaseError::OpenFailed(_))
        ));
    }
}
