// Infrastructure layer modules
pub mod config;
pub mod logging;
pub mod object_storage;

// Re-exports
pub use config::{ConfigError, RelayConfig};
pub use logging::init_logging;
pub use object_storage::{ObjectStorage, S3ObjectStorage, StorageError};
