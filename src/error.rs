//! Error types for Handover.

use thiserror::Error;

/// Result type alias using Handover's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Handover operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Arena allocation or growth failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// An address could not be attributed to any loaded module, or a
    /// descriptor resolved to an address outside its module's span.
    #[error("address {address:#x} is not resolvable to a loaded module")]
    AddressNotResolvable {
        /// The absolute address that failed to resolve.
        address: usize,
    },

    /// A descriptor names a module that is not loaded in this process.
    #[error("module not loaded: {module}")]
    ModuleNotLoaded {
        /// Name of the missing module.
        module: String,
    },

    /// No object with the requested name exists in the context.
    #[error("object not found: {name}")]
    ObjectNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// A platform stream handle could not be stored or reconstructed.
    #[error("platform handle error: {0}")]
    PlatformHandle(String),

    /// An arena image or element record failed validation.
    #[error("invalid context image: {0}")]
    InvalidImage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
