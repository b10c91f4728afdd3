use std::sync::Arc;

/// Everything that can go wrong with a single file request. Clone so that one failure can be fanned
/// out to a parent request and all of its children.
#[derive(Debug, Clone)]
pub enum StreamerError {
    StringError(String),
    IoError(Arc<std::io::Error>),
    JsonError(Arc<serde_json::Error>),
    // The request path could not be turned into an absolute path, usually an unknown alias
    InvalidPath(String),
    FileNotFound(String),
    ReadPastEndOfFile {
        file_size: u64,
        offset: u64,
        size: u64,
    },
    // Offset plus size doesn't fit in a file offset
    InvalidRange {
        offset: u64,
        size: u64,
    },
    // The destination allocator could not provide the staging memory for the request
    OutOfMemory {
        requested: u64,
    },
    // The deadline passed before the request was handed to the hardware
    DeadlineExceeded,
    Canceled,
    // Nothing in the stream stack was able to service the request
    NoStorageAvailable,
    ShuttingDown,
}

impl StreamerError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, StreamerError::Canceled)
    }
}

impl std::error::Error for StreamerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            StreamerError::IoError(ref e) => Some(&**e),
            StreamerError::JsonError(ref e) => Some(&**e),
            _ => None,
        }
    }
}

impl core::fmt::Display for StreamerError {
    fn fmt(
        &self,
        fmt: &mut core::fmt::Formatter,
    ) -> core::fmt::Result {
        match *self {
            StreamerError::StringError(ref e) => e.fmt(fmt),
            StreamerError::IoError(ref e) => e.fmt(fmt),
            StreamerError::JsonError(ref e) => e.fmt(fmt),
            StreamerError::InvalidPath(ref path) => write!(fmt, "Unable to resolve path '{}'", path),
            StreamerError::FileNotFound(ref path) => write!(fmt, "File '{}' not found", path),
            StreamerError::ReadPastEndOfFile {
                file_size,
                offset,
                size,
            } => write!(
                fmt,
                "Read of {} bytes at offset {} goes past the end of a {} byte file",
                size, offset, file_size
            ),
            StreamerError::InvalidRange { offset, size } => write!(
                fmt,
                "Read of {} bytes at offset {} is out of range",
                size, offset
            ),
            StreamerError::OutOfMemory { requested } => write!(
                fmt,
                "Unable to allocate {} bytes for the request",
                requested
            ),
            StreamerError::DeadlineExceeded => "DeadlineExceeded".fmt(fmt),
            StreamerError::Canceled => "Canceled".fmt(fmt),
            StreamerError::NoStorageAvailable => "NoStorageAvailable".fmt(fmt),
            StreamerError::ShuttingDown => "ShuttingDown".fmt(fmt),
        }
    }
}

impl From<&str> for StreamerError {
    fn from(str: &str) -> Self {
        StreamerError::StringError(str.to_string())
    }
}

impl From<String> for StreamerError {
    fn from(string: String) -> Self {
        StreamerError::StringError(string)
    }
}

impl From<std::io::Error> for StreamerError {
    fn from(error: std::io::Error) -> Self {
        StreamerError::IoError(Arc::new(error))
    }
}

impl From<serde_json::Error> for StreamerError {
    fn from(error: serde_json::Error) -> Self {
        StreamerError::JsonError(Arc::new(error))
    }
}

pub type StreamerResult<T> = Result<T, StreamerError>;
