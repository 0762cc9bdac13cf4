pub mod database;
pub mod error;
pub mod log_store;
pub mod row_helpers;
pub mod schema;

pub use database::{remove_database_files, Database};
pub use error::StoreError;
pub use log_store::LogStore;
