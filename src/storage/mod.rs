// Storage - RocksDB persistence for consensus safety data

pub mod db;
pub mod persister;

pub use db::{Database, DatabaseError};
pub use persister::DbPersister;
