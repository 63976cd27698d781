// SQLite persistence for Conveyor
//
// Write-through store for workflow instances, resources and users, with
// idempotent migrations, WAL for reader/writer concurrency and transparent
// encryption of marked PII fields.

pub mod encryption;
pub mod instance_store;
pub mod models;
pub mod store;

pub use encryption::{generate_encryption_key, FieldEncryptor};
pub use instance_store::SqliteInstanceStore;
pub use models::UserRecord;
pub use store::Store;
