//! Error types for grid construction and container execution.

use crate::domain::Index3d;

/// Result type for grid and container operations.
pub type Result<T> = std::result::Result<T, GridError>;

/// Errors raised by the classifier, the containers and the sequencer.
///
/// Every variant is fatal for the object that raised it: nothing is retried
/// internally, and recovery means rebuilding from corrected inputs.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    /// A partition owns too few Z slices to host both boundary regions.
    #[error(
        "domain too small for the number of devices: partition {set_idx} owns block slices \
         [{first_z}, {last_z}] but needs at least twice the boundary depth of {depth} blocks; \
         block span {block_span}\n{decomposition}"
    )]
    InfeasibleDecomposition {
        set_idx: usize,
        first_z: i32,
        last_z: i32,
        depth: i32,
        block_span: Index3d,
        decomposition: String,
    },

    /// Invalid construction input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation the container variant does not support.
    #[error("unsupported operation on container `{container}`: {reason}")]
    Usage { container: String, reason: String },

    /// A sub-component could not be constructed.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Partition index outside `[0, device_count)`.
    #[error("partition {set_idx} out of range (device count {device_count})")]
    PartitionOutOfRange { set_idx: usize, device_count: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GridError {
    pub(crate) fn usage(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Usage {
            container: container.into(),
            reason: reason.into(),
        }
    }
}
