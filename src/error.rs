//! Error types for the detector simulator.
//!
//! `DetectorError` is the single error type of the library. Every failure the
//! stream engine can surface falls into one of a few categories:
//!
//! - **Configuration**: unsupported compression, unsupported element width, or a
//!   data-file count that does not fit the loaded container. These abort only
//!   the current operation; previously loaded frames stay in place.
//! - **Metadata**: a critical acquisition field (trigger or image count) is
//!   missing from the container. Non-critical fields never produce an error,
//!   they fall back to a logged default.
//! - **Dataset**: the container itself could not be opened or read.
//! - **Transport**: a message could not be pushed onto the stream socket. Sends
//!   are never retried.
//! - **Sequencing**: a command was issued in a state that does not allow it,
//!   e.g. `trigger` before `arm` or before any dataset was loaded.
//!
//! None of these are fatal to the process; the caller decides what to do.

use thiserror::Error;

/// Convenience alias for results using the simulator error type.
pub type DetectorResult<T> = std::result::Result<T, DetectorError>;

/// Every failure the simulator can report.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// Compression name other than bslz4 or none.
    #[error("Unsupported compression '{0}'. Supported compressions are bslz4 and none")]
    UnsupportedCompression(String),

    /// Element width other than 16 or 32 bits.
    #[error("Unsupported pixel type '{0}'. Supported types are uint16 and uint32")]
    UnsupportedPixelType(String),

    /// More data files requested than the container holds.
    #[error("Requested {requested} data files but the master file references {available}")]
    FileCountOutOfRange {
        /// Files asked for
        requested: usize,
        /// Files referenced by the master file
        available: usize,
    },

    /// A count of zero data files.
    #[error("At least one data file must be loaded")]
    InvalidFileCount,

    /// A critical acquisition field is absent.
    #[error("Required metadata entry missing: {0}")]
    MissingMetadata(String),

    /// The container could not be opened or read.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Trigger or arm before any dataset was loaded.
    #[error("No dataset loaded")]
    NotLoaded,

    /// Trigger without a preceding arm.
    #[error("Detector is not armed")]
    NotArmed,

    /// A second load while one is running.
    #[error("A dataset load is already in progress")]
    LoadInProgress,

    /// Send on the stream socket failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// CBOR serialization failed.
    #[error("CBOR encode error: {0}")]
    Encode(String),

    /// CBOR payload could not be parsed.
    #[error("CBOR decode error: {0}")]
    Decode(String),

    /// Needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The detector task has exited.
    #[error("Detector actor is no longer running")]
    ActorStopped,
}

/// Coarse classification of a [`DetectorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected settings.
    Configuration,
    /// Missing critical metadata.
    Metadata,
    /// Unreadable container.
    Dataset,
    /// Socket send failure.
    Transport,
    /// Command issued in the wrong state.
    Sequencing,
    /// Codec or actor failure.
    Internal,
}

impl DetectorError {
    /// Which part of the taxonomy this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DetectorError::UnsupportedCompression(_)
            | DetectorError::UnsupportedPixelType(_)
            | DetectorError::FileCountOutOfRange { .. }
            | DetectorError::InvalidFileCount
            | DetectorError::FeatureNotEnabled(_) => ErrorCategory::Configuration,
            DetectorError::MissingMetadata(_) => ErrorCategory::Metadata,
            DetectorError::Dataset(_) => ErrorCategory::Dataset,
            DetectorError::Transport(_) => ErrorCategory::Transport,
            DetectorError::NotLoaded | DetectorError::NotArmed | DetectorError::LoadInProgress => {
                ErrorCategory::Sequencing
            }
            DetectorError::Encode(_) | DetectorError::Decode(_) | DetectorError::ActorStopped => {
                ErrorCategory::Internal
            }
        }
    }
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for DetectorError {
    fn from(value: hdf5::Error) -> Self {
        DetectorError::Dataset(value.to_string())
    }
}

impl From<zeromq::ZmqError> for DetectorError {
    fn from(value: zeromq::ZmqError) -> Self {
        DetectorError::Transport(value.to_string())
    }
}
