//! Error types for TapFlow

use thiserror::Error;

/// TapFlow error type
#[derive(Error, Debug)]
pub enum TapFlowError {
    /// Group or EPC id does not fit the 20-bit field of the packed keys
    #[error("group id {0} exceeds the 20-bit packed-key space")]
    GroupIdOverflow(u32),

    /// Numeric tap type outside the known range
    #[error("invalid tap type: {0}")]
    InvalidTapType(u8),

    /// Rule rejected at ingest
    #[error("invalid acl {id}: {reason}")]
    InvalidAcl {
        /// Rule id as carried by the rule source
        id: u32,
        /// Why the rule was rejected
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for TapFlow
pub type TapFlowResult<T> = Result<T, TapFlowError>;
