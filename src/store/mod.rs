//! Persistence layer — libSQL record store and filesystem blob store.

pub mod blob;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use blob::FilesystemBlobStore;
pub use libsql_backend::LibSqlBackend;
pub use traits::{BlobStore, DateQuery, ImageStore, RecordPage};
