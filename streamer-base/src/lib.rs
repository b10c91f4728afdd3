pub mod hashing;

mod lru_cache;
pub use lru_cache::LruCache;

mod streamer_error;
pub use streamer_error::*;

pub mod file_io_aliases;
pub use file_io_aliases::{FileIoAliases, DEFAULT_ROOT_ALIAS};

pub mod request_path;
pub use request_path::{RequestPath, EMPTY_PATH_HASH, INVALID_PATH_HASH};

pub mod memory;
pub use memory::{
    AllocatorLock, BufferWindow, DefaultRequestMemoryAllocator, MemoryType, Recommendations,
    RequestBuffer, RequestMemoryAllocator, RequestMemoryAllocatorResult,
};
