use crate::file_io_aliases::{is_separator, FileIoAliases};
use crate::hashing::hash_path;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Hash reported for a path that hasn't been set or hasn't been resolved yet
pub const EMPTY_PATH_HASH: u64 = u64::MIN;
/// Hash reported for a path that failed to resolve
pub const INVALID_PATH_HASH: u64 = u64::MAX;

#[derive(Clone, Debug)]
enum PathState {
    Empty,
    // Holds the path as given. The offset excludes the alias so the relative part can be returned
    // without resolving.
    Unresolved {
        path: String,
        relative_offset: usize,
    },
    // Holds the absolute path. The offset points at the start of the original relative part.
    Resolved {
        absolute_path: String,
        hash: u64,
        relative_offset: usize,
    },
    Invalid {
        path: String,
        relative_offset: usize,
    },
}

/// The path to the file used by a request.
///
/// Paths are resolved lazily: setting a path never touches the alias table. Resolution is an
/// explicit, idempotent transition that happens the first time the absolute path, hash or
/// validity is asked for, after which the result is cached in the value and carried along by clones.
#[derive(Clone, Debug)]
pub struct RequestPath {
    state: PathState,
}

impl Default for RequestPath {
    fn default() -> Self {
        RequestPath {
            state: PathState::Empty,
        }
    }
}

impl RequestPath {
    pub fn from_relative_path(path: impl Into<String>) -> Self {
        let mut request_path = RequestPath::default();
        request_path.init_from_relative_path(path);
        request_path
    }

    pub fn from_absolute_path(path: impl Into<String>) -> Self {
        let mut request_path = RequestPath::default();
        request_path.init_from_absolute_path(path);
        request_path
    }

    /// Sets a path that may start with an alias or be relative to the default root. No resolution
    /// is done until it's needed.
    pub fn init_from_relative_path(
        &mut self,
        path: impl Into<String>,
    ) {
        let path = path.into();
        self.state = if path.is_empty() {
            PathState::Empty
        } else {
            PathState::Unresolved {
                relative_offset: find_alias_offset(&path),
                path,
            }
        };
    }

    /// Sets a path that is already absolute. It's considered resolved straight away.
    pub fn init_from_absolute_path(
        &mut self,
        path: impl Into<String>,
    ) {
        let path = path.into();
        self.state = if path.is_empty() {
            PathState::Empty
        } else {
            PathState::Resolved {
                hash: hash_path(&path),
                absolute_path: path,
                relative_offset: 0,
            }
        };
    }

    /// Resolves the path if that hasn't happened yet. Returns true if the path is valid.
    pub fn resolve(
        &mut self,
        aliases: &FileIoAliases,
    ) -> bool {
        let resolved_state = match &self.state {
            PathState::Unresolved {
                path,
                relative_offset,
            } => {
                let relative_path = &path[*relative_offset..];
                match aliases.resolve_path(path) {
                    Some(absolute_path)
                        if absolute_path.len() >= relative_path.len()
                            && absolute_path.ends_with(relative_path) =>
                    {
                        PathState::Resolved {
                            hash: hash_path(&absolute_path),
                            relative_offset: absolute_path.len() - relative_path.len(),
                            absolute_path,
                        }
                    }
                    _ => {
                        log::debug!("Failed to resolve request path '{}'", path);
                        PathState::Invalid {
                            path: path.clone(),
                            relative_offset: *relative_offset,
                        }
                    }
                }
            }
            _ => return self.is_resolved_and_valid(),
        };

        self.state = resolved_state;
        self.is_resolved_and_valid()
    }

    pub fn is_valid(
        &mut self,
        aliases: &FileIoAliases,
    ) -> bool {
        self.resolve(aliases)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.state, PathState::Empty)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            PathState::Resolved { .. } | PathState::Invalid { .. }
        )
    }

    fn is_resolved_and_valid(&self) -> bool {
        matches!(self.state, PathState::Resolved { .. })
    }

    /// The absolute path. If resolution failed this is the path as it was given.
    pub fn absolute_path(
        &mut self,
        aliases: &FileIoAliases,
    ) -> &str {
        self.resolve(aliases);
        self.current_path()
    }

    /// The absolute path, only if the path has already been successfully resolved
    pub fn resolved_absolute_path(&self) -> Option<&str> {
        match &self.state {
            PathState::Resolved { absolute_path, .. } => Some(absolute_path),
            _ => None,
        }
    }

    /// The path without its alias or root. Doesn't require resolving.
    pub fn relative_path(&self) -> &str {
        match &self.state {
            PathState::Empty => "",
            PathState::Unresolved {
                path,
                relative_offset,
            }
            | PathState::Invalid {
                path,
                relative_offset,
            } => &path[*relative_offset..],
            PathState::Resolved {
                absolute_path,
                relative_offset,
                ..
            } => &absolute_path[*relative_offset..],
        }
    }

    pub fn hash(
        &mut self,
        aliases: &FileIoAliases,
    ) -> u64 {
        self.resolve(aliases);
        self.cached_hash()
    }

    /// The hash as of the last resolve. EMPTY_PATH_HASH if not resolved yet.
    pub fn cached_hash(&self) -> u64 {
        match &self.state {
            PathState::Empty | PathState::Unresolved { .. } => EMPTY_PATH_HASH,
            PathState::Resolved { hash, .. } => *hash,
            PathState::Invalid { .. } => INVALID_PATH_HASH,
        }
    }

    pub fn clear(&mut self) {
        self.state = PathState::Empty;
    }

    /// Moves the path out, leaving this one empty
    pub fn take(&mut self) -> RequestPath {
        std::mem::take(self)
    }

    fn current_path(&self) -> &str {
        match &self.state {
            PathState::Empty => "",
            PathState::Unresolved { path, .. } | PathState::Invalid { path, .. } => path,
            PathState::Resolved { absolute_path, .. } => absolute_path,
        }
    }

    // Same value as the resolved hash when resolved, which keeps Hash consistent with PartialEq
    fn key_hash(&self) -> u64 {
        match &self.state {
            PathState::Empty => EMPTY_PATH_HASH,
            PathState::Resolved { hash, .. } => *hash,
            _ => hash_path(self.current_path()),
        }
    }
}

// Returns the offset just past a leading "@alias@" and any separators that follow it
fn find_alias_offset(path: &str) -> usize {
    if let Some(rest) = path.strip_prefix('@') {
        if let Some(alias_end) = rest.find('@') {
            let after_alias = alias_end + 2;
            let remainder = &path[after_alias..];
            return after_alias + (remainder.len() - remainder.trim_start_matches(is_separator).len());
        }
    }

    0
}

impl PartialEq for RequestPath {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        if self.is_empty() || other.is_empty() {
            return self.is_empty() == other.is_empty();
        }

        self.key_hash() == other.key_hash() && self.current_path() == other.current_path()
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        state.write_u64(self.key_hash());
    }
}

impl fmt::Display for RequestPath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.current_path())
    }
}
