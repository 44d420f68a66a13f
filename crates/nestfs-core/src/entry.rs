use chrono::{DateTime, Utc};
use serde::Serialize;

/// Kinds of sizes an entry may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Size {
    /// Logical size of the decoded content.
    Data,
    /// Physical size occupied in the backing store.
    Storage,
}

/// Kinds of access times an entry may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    Create,
    Read,
    Write,
    Execute,
}

impl Size {
    const ALL: [Size; 2] = [Size::Data, Size::Storage];

    fn index(self) -> usize {
        self as usize
    }
}

impl Access {
    const ALL: [Access; 4] = [Access::Create, Access::Read, Access::Write, Access::Execute];

    fn index(self) -> usize {
        self as usize
    }
}

/// A named resource with optional metadata.
///
/// A metadata value that is not known is `None`, which is distinct from zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    name: String,
    sizes: [Option<u64>; 2],
    times: [Option<DateTime<Utc>>; 4],
}

impl Entry {
    /// Create an entry with unknown metadata.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sizes: [None; 2],
            times: [None; 4],
        }
    }

    /// Get the entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a size of the given kind, if known.
    pub fn size(&self, kind: Size) -> Option<u64> {
        self.sizes[kind.index()]
    }

    /// Set or forget a size of the given kind.
    pub fn set_size(&mut self, kind: Size, value: Option<u64>) {
        self.sizes[kind.index()] = value;
    }

    /// Get an access time of the given kind, if known.
    pub fn time(&self, kind: Access) -> Option<DateTime<Utc>> {
        self.times[kind.index()]
    }

    /// Set or forget an access time of the given kind.
    pub fn set_time(&mut self, kind: Access, value: Option<DateTime<Utc>>) {
        self.times[kind.index()] = value;
    }

    /// Builder-style variant of [`Entry::set_size`].
    pub fn with_size(mut self, kind: Size, value: u64) -> Self {
        self.set_size(kind, Some(value));
        self
    }

    /// Builder-style variant of [`Entry::set_time`].
    pub fn with_time(mut self, kind: Access, value: DateTime<Utc>) -> Self {
        self.set_time(kind, Some(value));
        self
    }

    /// Copy every known metadata value of `other` into this entry, keeping the name.
    pub fn merge_from(&mut self, other: &Entry) {
        for kind in Size::ALL {
            if let Some(value) = other.size(kind) {
                self.set_size(kind, Some(value));
            }
        }
        for kind in Access::ALL {
            if let Some(value) = other.time(kind) {
                self.set_time(kind, Some(value));
            }
        }
    }
}
