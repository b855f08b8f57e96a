// FHIR Export Infrastructure - SQLite Adapter
// Implements: JobStore (compare-and-swap status writes), Maintenance (retention)

mod connection;
mod job_store;
mod maintenance_impl;
mod migration;

pub use connection::create_pool;
pub use job_store::SqliteJobStore;
pub use maintenance_impl::SqliteMaintenance;
pub use migration::run_migrations;

// Note: sqlx::Error conversion is handled by a helper function
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for ExportError here)
