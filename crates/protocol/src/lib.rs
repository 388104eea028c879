//! Data types shared by every layer of the chunkwise upload engine.
//!
//! Everything here is plain serde data: upload destinations, lifecycle
//! statuses, and the events emitted to consumers.

pub mod events;
pub mod types;

pub use events::{ErrorCode, UploadEvent};
pub use types::{FileIdentity, UploadContext, UploadProgress, UploadStatus};
