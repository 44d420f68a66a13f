use crate::{Error, MountPoint};
use serde::Serialize;
use std::fmt;

/// Options controlling how a filesystem is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Wait for streams opened by other threads to be closed.
    pub wait_close_io: bool,
    /// Force-close streams that are still open.
    pub force_close_io: bool,
    /// Drop cached entries and unmount after flushing.
    pub clear_cache: bool,
    /// Upper bound for waiting in milliseconds; zero waits indefinitely.
    pub timeout_ms: u64,
}

impl SyncOptions {
    /// Flush caches and the backing store, leaving streams and caches alone.
    pub const FLUSH: Self = Self {
        wait_close_io: false,
        force_close_io: false,
        clear_cache: false,
        timeout_ms: 0,
    };

    /// Force-close open streams, flush and unmount.
    pub const SYNC: Self = Self {
        wait_close_io: false,
        force_close_io: true,
        clear_cache: true,
        timeout_ms: 0,
    };

    /// Wait for open streams, force-close stragglers, flush and unmount.
    pub const UMOUNT: Self = Self {
        wait_close_io: true,
        force_close_io: true,
        clear_cache: true,
        timeout_ms: 0,
    };

    /// Wait for open streams, then flush and unmount.
    ///
    /// Streams still open after the timeout are left alone and the sync fails
    /// with Busy.
    pub const EVICT: Self = Self {
        wait_close_io: true,
        force_close_io: false,
        clear_cache: true,
        timeout_ms: 0,
    };

    /// Flush and unmount, failing if any stream is still open.
    pub const RESET: Self = Self {
        wait_close_io: false,
        force_close_io: false,
        clear_cache: true,
        timeout_ms: 0,
    };

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::SYNC
    }
}

/// How bad a synchronization failure is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    /// The filesystem was synchronized, but something noteworthy happened.
    Warning,
    /// The filesystem could not be synchronized.
    Fatal,
}

/// One failure recorded while synchronizing a filesystem.
#[derive(Debug)]
pub struct SyncFailure {
    pub mount_point: MountPoint,
    pub severity: Severity,
    pub error: Error,
}

/// Every failure collected while synchronizing one or more filesystems.
#[derive(Debug, Default)]
pub struct SyncError {
    failures: Vec<SyncFailure>,
}

impl SyncError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, mount_point: &MountPoint, error: impl Into<Error>) {
        self.push(mount_point, Severity::Warning, error.into());
    }

    pub fn fatal(&mut self, mount_point: &MountPoint, error: impl Into<Error>) {
        self.push(mount_point, Severity::Fatal, error.into());
    }

    fn push(&mut self, mount_point: &MountPoint, severity: Severity, error: Error) {
        self.failures.push(SyncFailure {
            mount_point: mount_point.clone(),
            severity,
            error,
        });
    }

    /// Append every failure of `other`.
    pub fn extend(&mut self, other: SyncError) {
        self.failures.extend(other.failures);
    }

    pub fn failures(&self) -> &[SyncFailure] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// The worst severity recorded; warnings if nothing was recorded.
    pub fn severity(&self) -> Severity {
        self.failures
            .iter()
            .map(|failure| failure.severity)
            .max()
            .unwrap_or(Severity::Warning)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }

    /// Returns `true` if there are fatal failures and every one of them is Busy.
    pub fn is_busy(&self) -> bool {
        let mut fatal = self
            .failures
            .iter()
            .filter(|failure| failure.severity == Severity::Fatal)
            .peekable();
        fatal.peek().is_some() && fatal.all(|failure| failure.error.is_busy())
    }

    /// `Ok` if nothing was recorded, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), SyncError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity() {
            Severity::Warning => "warning",
            Severity::Fatal => "failed",
        };
        write!(f, "sync {} ({} issue(s))", label, self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.mount_point, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| &failure.error as &(dyn std::error::Error + 'static))
    }
}
