use crate::hashing::HashMap;
use std::path::Path;

/// Alias that relative paths without an alias of their own are resolved against
pub const DEFAULT_ROOT_ALIAS: &str = "@assets@";

pub(crate) fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Maps `@name@` tokens at the start of a path to directories on disk, for example
/// `@assets@/textures/foo.dds` -> `/game/assets/textures/foo.dds`.
///
/// Aliases are set up before the streamer starts and then shared read-only with the I/O thread.
#[derive(Debug, Clone, Default)]
pub struct FileIoAliases {
    aliases: HashMap<String, String>,
}

impl FileIoAliases {
    pub fn new() -> Self {
        Self::default()
    }

    // Accepts both "assets" and "@assets@"
    fn normalize_alias(alias: &str) -> String {
        format!("@{}@", alias.trim_matches('@').to_lowercase())
    }

    pub fn set_alias(
        &mut self,
        alias: &str,
        path: impl Into<String>,
    ) {
        let path = path.into();
        let trimmed = path.trim_end_matches(is_separator);
        // Don't trim a root like "/" down to nothing
        let path = if trimmed.is_empty() {
            path
        } else {
            trimmed.to_string()
        };
        log::debug!("Set alias {} -> {}", Self::normalize_alias(alias), path);
        self.aliases.insert(Self::normalize_alias(alias), path);
    }

    pub fn clear_alias(
        &mut self,
        alias: &str,
    ) -> Option<String> {
        self.aliases.remove(&Self::normalize_alias(alias))
    }

    pub fn alias(
        &self,
        alias: &str,
    ) -> Option<&str> {
        self.aliases
            .get(&Self::normalize_alias(alias))
            .map(|x| x.as_str())
    }

    /// The directories that the aliases expand to
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.aliases.values().map(|x| x.as_str())
    }

    /// Converts a path into an absolute path. Returns None if the path starts with an unknown alias
    /// or is relative while no default root alias is registered.
    pub fn resolve_path(
        &self,
        path: &str,
    ) -> Option<String> {
        if let Some(rest) = path.strip_prefix('@') {
            let alias_end = rest.find('@')? + 2;
            let expansion = self.aliases.get(&path[..alias_end].to_lowercase())?;
            let remainder = path[alias_end..].trim_start_matches(is_separator);
            Some(join(expansion, remainder))
        } else if Path::new(path).is_absolute() || path.starts_with(is_separator) {
            Some(path.to_string())
        } else {
            let expansion = self.aliases.get(DEFAULT_ROOT_ALIAS)?;
            Some(join(expansion, path))
        }
    }
}

fn join(
    root: &str,
    remainder: &str,
) -> String {
    if remainder.is_empty() {
        root.to_string()
    } else if root.ends_with(is_separator) {
        format!("{}{}", root, remainder)
    } else {
        format!("{}/{}", root, remainder)
    }
}
