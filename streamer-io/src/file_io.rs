use std::fs::File;
use std::sync::Arc;
use streamer_base::{LruCache, RequestPath, StreamerError, StreamerResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileOpenOptions {
    // Bypass the OS file cache. Reads then have to be sector aligned in offset, size and memory.
    pub unbuffered: bool,
    // Let other processes write to or delete files while they're open for reading
    pub enable_sharing: bool,
}

impl Default for FileOpenOptions {
    fn default() -> Self {
        FileOpenOptions {
            unbuffered: false,
            enable_sharing: true,
        }
    }
}

impl FileOpenOptions {
    /// Same options going through the OS file cache, for reads unbuffered handles can't do
    pub fn buffered(self) -> Self {
        FileOpenOptions {
            unbuffered: false,
            ..self
        }
    }
}

fn open_options(
    unbuffered: bool,
    enable_sharing: bool,
) -> std::fs::OpenOptions {
    let mut options = std::fs::OpenOptions::new();
    options.read(true);

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        if unbuffered {
            options.custom_flags(libc::O_DIRECT);
        }
        // Advisory locks only on unix, nothing to do for sharing
        let _ = enable_sharing;
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        const FILE_SHARE_READ: u32 = 0x1;
        const FILE_SHARE_WRITE: u32 = 0x2;
        const FILE_SHARE_DELETE: u32 = 0x4;
        const FILE_FLAG_NO_BUFFERING: u32 = 0x2000_0000;
        let share_mode = if enable_sharing {
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
        } else {
            FILE_SHARE_READ
        };
        options.share_mode(share_mode);
        if unbuffered {
            options.custom_flags(FILE_FLAG_NO_BUFFERING);
        }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (unbuffered, enable_sharing);
    }

    options
}

/// An open file and whether reads from it must be sector aligned
#[derive(Clone, Debug)]
pub struct OpenFile {
    pub file: Arc<File>,
    pub unbuffered: bool,
}

/// Opens a file for reading. Falls back to buffered reads if the file system doesn't support
/// unbuffered ones.
pub fn open_for_read(
    path: &str,
    options: FileOpenOptions,
) -> StreamerResult<OpenFile> {
    profiling::scope!("open_for_read");
    if options.unbuffered {
        match open_options(true, options.enable_sharing).open(path) {
            Ok(file) => {
                return Ok(OpenFile {
                    file: Arc::new(file),
                    unbuffered: true,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StreamerError::FileNotFound(path.to_string()))
            }
            Err(e) => {
                log::debug!(
                    "Unbuffered reads not available for '{}' ({}), using buffered reads",
                    path,
                    e
                );
            }
        }
    }

    match open_options(false, options.enable_sharing).open(path) {
        Ok(file) => Ok(OpenFile {
            file: Arc::new(file),
            unbuffered: false,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StreamerError::FileNotFound(path.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Reads at `offset` until `buffer` is full or the end of the file is reached. Returns the number of
/// bytes read.
pub fn read_at(
    file: &File,
    offset: u64,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        match read_at_once(file, offset + total as u64, &mut buffer[total..]) {
            Ok(0) => break,
            Ok(count) => total += count,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn read_at_once(
    file: &File,
    offset: u64,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buffer, offset)
}

#[cfg(windows)]
fn read_at_once(
    file: &File,
    offset: u64,
    buffer: &mut [u8],
) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buffer, offset)
}

/// Open file handles and file sizes of recently used files
pub struct FileHandleCache {
    handles: LruCache<RequestPath, OpenFile>,
    file_sizes: LruCache<RequestPath, u64>,
    options: FileOpenOptions,
    num_opened: u64,
    num_handle_hits: u64,
}

impl FileHandleCache {
    pub fn new(
        max_file_handles: u32,
        max_meta_data_cache: u32,
        options: FileOpenOptions,
    ) -> Self {
        FileHandleCache {
            handles: LruCache::new(max_file_handles.max(1)),
            file_sizes: LruCache::new(max_meta_data_cache.max(1)),
            options,
            num_opened: 0,
            num_handle_hits: 0,
        }
    }

    pub fn options(&self) -> FileOpenOptions {
        self.options
    }

    pub fn open(
        &mut self,
        path: &RequestPath,
    ) -> StreamerResult<OpenFile> {
        if let Some(file) = self.handles.get(path) {
            self.num_handle_hits += 1;
            return Ok(file.clone());
        }

        let absolute_path = path
            .resolved_absolute_path()
            .ok_or_else(|| StreamerError::InvalidPath(path.to_string()))?;
        let file = open_for_read(absolute_path, self.options)?;
        self.num_opened += 1;
        if let Some((evicted, _)) = self.handles.insert(path.clone(), file.clone()) {
            log::trace!("Closed file handle for '{}'", evicted);
        }
        Ok(file)
    }

    pub fn file_size(
        &mut self,
        path: &RequestPath,
    ) -> StreamerResult<u64> {
        if let Some(size) = self.file_sizes.get(path) {
            return Ok(*size);
        }

        let size = match self.handles.peek(path) {
            Some(open_file) => open_file.file.metadata()?.len(),
            None => {
                let absolute_path = path
                    .resolved_absolute_path()
                    .ok_or_else(|| StreamerError::InvalidPath(path.to_string()))?;
                match std::fs::metadata(absolute_path) {
                    Ok(metadata) if metadata.is_file() => metadata.len(),
                    Ok(_) => return Err(StreamerError::FileNotFound(absolute_path.to_string())),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(StreamerError::FileNotFound(absolute_path.to_string()))
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.file_sizes.insert(path.clone(), size);
        Ok(size)
    }

    pub fn exists(
        &mut self,
        path: &RequestPath,
    ) -> StreamerResult<bool> {
        match self.file_size(path) {
            Ok(_) => Ok(true),
            Err(StreamerError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn flush(
        &mut self,
        path: &RequestPath,
    ) {
        self.handles.remove(path);
        self.file_sizes.remove(path);
    }

    pub fn flush_all(&mut self) {
        self.handles.clear();
        self.file_sizes.clear();
    }

    pub fn num_open_handles(&self) -> usize {
        self.handles.len()
    }

    pub fn num_opened(&self) -> u64 {
        self.num_opened
    }

    pub fn num_handle_hits(&self) -> u64 {
        self.num_handle_hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> (std::path::PathBuf, RequestPath) {
        let path = std::env::temp_dir().join(format!("streamer-{}.bin", uuid::Uuid::new_v4()));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        let request_path = RequestPath::from_absolute_path(path.to_string_lossy().to_string());
        (path, request_path)
    }

    #[test]
    fn buffered_options_keep_sharing() {
        let options = FileOpenOptions {
            unbuffered: true,
            enable_sharing: false,
        };
        assert_eq!(
            options.buffered(),
            FileOpenOptions {
                unbuffered: false,
                enable_sharing: false,
            }
        );
        assert_eq!(FileOpenOptions::default().buffered(), FileOpenOptions::default());
    }

    #[test]
    fn read_whole_file_and_short_read_at_end() {
        let (path, request_path) = temp_file(b"0123456789");
        let mut cache = FileHandleCache::new(4, 4, FileOpenOptions::default());
        let open_file = cache.open(&request_path).unwrap();

        let mut buffer = [0u8; 4];
        assert_eq!(read_at(&open_file.file, 2, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer, b"2345");

        let mut buffer = [0u8; 8];
        assert_eq!(read_at(&open_file.file, 6, &mut buffer).unwrap(), 4);
        assert_eq!(&buffer[..4], b"6789");

        assert_eq!(cache.file_size(&request_path).unwrap(), 10);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn handles_are_reused_until_flushed() {
        let (path, request_path) = temp_file(b"abc");
        let mut cache = FileHandleCache::new(4, 4, FileOpenOptions::default());
        cache.open(&request_path).unwrap();
        cache.open(&request_path).unwrap();
        assert_eq!(cache.num_opened(), 1);
        assert_eq!(cache.num_handle_hits(), 1);

        cache.flush(&request_path);
        assert_eq!(cache.num_open_handles(), 0);
        cache.open(&request_path).unwrap();
        assert_eq!(cache.num_opened(), 2);

        cache.flush_all();
        assert_eq!(cache.num_open_handles(), 0);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_file() {
        let path = std::env::temp_dir().join(format!("streamer-{}.bin", uuid::Uuid::new_v4()));
        let request_path = RequestPath::from_absolute_path(path.to_string_lossy().to_string());
        let mut cache = FileHandleCache::new(4, 4, FileOpenOptions::default());
        assert!(matches!(
            cache.open(&request_path),
            Err(StreamerError::FileNotFound(_))
        ));
        assert!(!cache.exists(&request_path).unwrap());
    }

    #[test]
    fn unbuffered_open_falls_back() {
        let (path, request_path) = temp_file(b"abc");
        let options = FileOpenOptions {
            unbuffered: true,
            enable_sharing: false,
        };
        let mut cache = FileHandleCache::new(4, 4, options);
        // Either mode is fine depending on the file system, opening must succeed
        assert!(cache.open(&request_path).is_ok());
        std::fs::remove_file(path).unwrap();
    }
}
