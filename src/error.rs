use thiserror::Error;

/// Top-level error for every fallible runtime operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("assembly load failed: {0}")]
    Load(#[from] LoadError),

    #[error("heap error: {0}")]
    Heap(#[from] HeapError),
}

/// Fail-fast parse errors. Any of these aborts the surrounding read/load;
/// there is no recovery inside a metadata blob.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("unexpected end of metadata at byte {offset} (expected '{expected}')")]
    UnexpectedEof { offset: usize, expected: char },

    #[error("invalid type size {text:?} at byte {offset}")]
    InvalidSize { offset: usize, text: String },

    #[error("expected '{expected}' at byte {offset}, found '{found}'")]
    UnexpectedChar {
        offset: usize,
        expected: char,
        found: char,
    },

    #[error("field declarations are not supported in metadata (byte {offset})")]
    FieldDecl { offset: usize },

    #[error("member address table exhausted at index {index}")]
    AddressTableExhausted { index: usize },
}

/// Member and type lookup failures. These are value-like and recoverable by
/// the caller; "not found" is always distinguishable from "found but wrong
/// kind" because each lookup only considers members of its own kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("no matching constructor on {0}")]
    ConstructorNotFound(String),

    #[error("no destructor declared on {0}")]
    DestructorNotFound(String),

    #[error("method not found: {type_name}::{member}")]
    MethodNotFound { type_name: String, member: String },

    #[error("field not found: {type_name}::{member}")]
    FieldNotFound { type_name: String, member: String },

    #[error("property not found: {type_name}::{member}")]
    PropertyNotFound { type_name: String, member: String },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("attempted to load assembly '{0}' without reading it first")]
    AssemblyNotRead(String),

    #[error("failed to open module: {0}")]
    Library(#[from] libloading::Error),

    #[error("module is missing required export '{0}'")]
    MissingExport(String),

    #[error("assembly '{0}' declares no entry point")]
    NoEntryPoint(String),

    #[error("module metadata is not valid UTF-8")]
    MetadataEncoding,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The reference policy: an unreachable object whose type declares no
    /// destructor aborts the sweep rather than leaking silently.
    #[error("cannot collect object of type {0}: no destructor declared")]
    MissingDestructor(String),

    #[error("requested allocation of {0} bytes exceeds the platform limit")]
    AllocationTooLarge(usize),

    #[error("member {0} is not a constructor")]
    NotAConstructor(String),
}
