//! Error types for noceg.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the analyzer, extractor and patcher.
#[derive(Error, Debug)]
pub enum Error {
    #[error("binary content is empty")]
    EmptySource,

    #[error("invalid DOS signature")]
    BadDosMagic,

    #[error("invalid PE signature")]
    BadPeMagic,

    #[error("ImageBase is zero")]
    ZeroImageBase,

    #[error("no section headers present")]
    NoFirstSection,

    #[error("raw data pointer of the first section is zero")]
    ZeroRawPointer,

    #[error("virtual size of the first section is zero")]
    ZeroVirtualSize,

    #[error("invalid byte pattern: '{0}'")]
    InvalidPattern(String),

    #[error("failed to read recipe: {0}")]
    ReadError(#[source] std::io::Error),

    #[error("failed to parse recipe: {0}")]
    ParseError(#[source] serde_json::Error),

    #[error("failed to write recipe: {0}")]
    WriteError(#[source] std::io::Error),

    #[error("CEG init function not present in the recipe")]
    InitFunctionNotFound,

    #[error("CEG register thread function not present in the recipe")]
    RegisterThreadFunctionNotFound,

    #[error("failed to create or acquire the restart mutex")]
    MutexCreateFailed,

    #[error("failed to retrieve the current module path")]
    GetModuleNameFailed,

    #[error("failed to spawn a new process")]
    CreateProcessFailed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
