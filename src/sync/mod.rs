//! Background synchronization with the central server.
//!
//! Two independent flows share one transport: the definition sync pulls a
//! new survey bundle when the advertised checksum differs from the cached
//! one, and the upload worker drains the completed-session queue with
//! exponential backoff. Both are opportunistic; the interview path never
//! waits on the network.

pub mod definition;
pub mod payload;
pub mod transport;
pub mod upload;

use thiserror::Error;

use crate::coupon::CouponError;
use crate::definition::DefinitionError;
use crate::store::StoreError;

pub use definition::DefinitionSync;
pub use payload::{build_upload, SessionUpload};
pub use transport::{HttpTransport, SyncTransport, UploadResponse, VersionInfo};
pub use upload::UploadWorker;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure: timeouts, connection errors, 5xx.
    /// Always retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The server understood the request and refused it (4xx). Retrying the
    /// same payload cannot succeed.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Downloaded bundle does not hash to the advertised checksum; the
    /// bundle is discarded and the next poll retries.
    #[error("definition checksum mismatch: advertised {advertised}, got {actual}")]
    ChecksumMismatch { advertised: String, actual: String },

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coupon(#[from] CouponError),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

impl SyncError {
    /// Errors that cannot be fixed by retrying the same request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Rejected { .. })
    }
}
