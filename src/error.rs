use thiserror::Error;

/// Errors produced by the container construction core.
///
/// Contract violations (inconsistent member partitioning, reading an offset
/// before layout, malformed call-site payloads) are programming errors and
/// panic instead of appearing here. Nothing in this enum is retried
/// automatically; retry policy belongs to the caller.
#[derive(Error, Debug)]
pub enum DexError {
    /// The serialized image would exceed the addressable range of the format
    /// (32-bit offsets, 16-bit indices in member records). Recoverable by
    /// caller policy, e.g. splitting the output across multiple containers.
    #[error("{section} exceeds addressable range: {requested} > {limit}")]
    CapacityExceeded {
        section: &'static str,
        requested: u64,
        limit: u64,
    },

    /// A class with the same type descriptor was already registered in this
    /// builder session. Reported per producer task; sibling tasks and the
    /// shared pools are unaffected.
    #[error("class {0} is already registered in this builder")]
    DuplicateClass(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DexError>;
