// Persister - Safety data stored in RocksDB
use super::db::{Database, DatabaseError};
use crate::consensus::config::SAFETY_DATA_KEY;
use crate::consensus::safety::{PersistError, Persister, SafetyData};
use std::path::Path;
use tracing::debug;

impl From<DatabaseError> for PersistError {
    fn from(e: DatabaseError) -> Self {
        PersistError::Storage(e.to_string())
    }
}

/// Durable persister; every write is synced before it returns
pub struct DbPersister {
    db: Database,
}

impl DbPersister {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        Ok(Self::new(Database::open(path)?))
    }
}

impl Persister for DbPersister {
    fn get_safety_data(&self) -> Result<SafetyData, PersistError> {
        match self.db.get(SAFETY_DATA_KEY)? {
            Some(bytes) => bincode::deserialize(&bytes).map_err(|e| PersistError::Serialization(e.to_string())),
            None => Ok(SafetyData::default()),
        }
    }

    fn put_safety_data(&self, data: &SafetyData) -> Result<(), PersistError> {
        let bytes = bincode::serialize(data).map_err(|e| PersistError::Serialization(e.to_string()))?;
        self.db.put_sync(SAFETY_DATA_KEY, &bytes)?;
        debug!(
            "Persisted safety data: acknowledged view {}, locked view {}",
            data.highest_acknowledged_view, data.locked_one_chain_view
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Block;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_on_empty_db() {
        let temp_dir = TempDir::new().unwrap();
        let persister = DbPersister::open(temp_dir.path()).unwrap();
        assert_eq!(persister.get_safety_data().unwrap(), SafetyData::default());
    }

    #[test]
    fn test_safety_data_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let data = SafetyData {
            locked_one_chain_view: 7,
            highest_acknowledged_view: 9,
            last_timeout: None,
            acknowledged_block: Some(Block::genesis(0)),
        };
        {
            let persister = DbPersister::open(temp_dir.path()).unwrap();
            persister.put_safety_data(&data).unwrap();
        }
        let persister = DbPersister::open(temp_dir.path()).unwrap();
        assert_eq!(persister.get_safety_data().unwrap(), data);
    }

    #[test]
    fn test_corrupt_data_is_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::open(temp_dir.path()).unwrap();
        db.put(SAFETY_DATA_KEY, &[0xff]).unwrap();
        let persister = DbPersister::new(db);
        assert!(matches!(
            persister.get_safety_data(),
            Err(PersistError::Serialization(_))
        ));
    }
}
