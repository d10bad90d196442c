// Domain layer modules
pub mod inbound_message;
pub mod object_metadata;
pub mod retry_policy;
pub mod storage_target;
pub mod upload_result;

// Re-exports
pub use inbound_message::{InboundMessage, MessageError};
pub use object_metadata::ObjectMetadata;
pub use retry_policy::{RetryPolicy, full_jitter, no_jitter, retry_with_backoff};
pub use storage_target::{StorageTarget, StorageTargetError};
pub use upload_result::{UploadOutcome, UploadResult};
