//! The built-in per-call filters.

pub mod call_credentials;
pub mod compression;
pub mod deadline;
pub mod metadata_status;

pub use call_credentials::CallCredentialsFilterFactory;
pub use compression::CompressionFilterFactory;
pub use deadline::DeadlineFilterFactory;
pub use metadata_status::MetadataStatusFilterFactory;
