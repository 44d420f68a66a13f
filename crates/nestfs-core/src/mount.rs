use serde::Serialize;
use std::fmt;

/// Separator between an archive and an archive nested inside it.
pub const SEPARATOR: &str = "!/";

/// Identity of one mounted filesystem.
///
/// A top-level mount point is the path of an archive file. Archives nested in
/// other archives append the entry name after [`SEPARATOR`], e.g.
/// `data/outer.zip!/inner.zip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MountPoint(String);

impl MountPoint {
    /// Create a top-level mount point from an archive path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_end_matches(SEPARATOR).to_string())
    }

    /// Mount point of the archive stored as `name` inside this one.
    pub fn nested(&self, name: &str) -> Self {
        Self(format!(
            "{}{}{}",
            self.0,
            SEPARATOR,
            name.trim_start_matches('/')
        ))
    }

    /// The enclosing mount point, or `None` for a top-level archive.
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once(SEPARATOR)
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// Name of this archive within its parent, or its path if top-level.
    pub fn archive_name(&self) -> &str {
        self.0
            .rsplit_once(SEPARATOR)
            .map_or(self.0.as_str(), |(_, name)| name)
    }

    pub fn is_top_level(&self) -> bool {
        self.depth() == 0
    }

    /// Number of archives enclosing this one.
    pub fn depth(&self) -> usize {
        self.0.matches(SEPARATOR).count()
    }

    /// Returns `true` if this is `ancestor` or nested anywhere below it.
    pub fn is_within(&self, ancestor: &MountPoint) -> bool {
        match self.0.strip_prefix(ancestor.0.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split `archive.zip!/inner.zip!/dir/file.txt` into the innermost mount
    /// point and the entry name within it.
    pub fn parse_entry_path(path: &str) -> Option<(MountPoint, String)> {
        let (mount, entry) = path.rsplit_once(SEPARATOR)?;
        if mount.is_empty() || entry.is_empty() {
            return None;
        }
        Some((MountPoint::new(mount), entry.to_string()))
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MountPoint {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}
