//! A file system manager that bounds the number of mounted file systems.
//!
//! Every controller registered with an [`EvictingManager`] is handed out
//! wrapped in a [`PacedController`]. After each operation the wrapper records
//! the access; when more than [`EvictingManager::max_mounted`] file systems
//! are mounted, the least recently used ones are queued for eviction. Before
//! each operation the queue is drained and the victims are synchronized with
//! [`SyncOptions::EVICT`], nested file systems first. Eviction waits a bounded
//! time for streams of other threads; a victim still in use is queued again.

use crate::controller::Controller;
use crate::socket::{SharedInput, SharedOutput};
use crate::sync::{SyncError, SyncOptions};
use crate::{Entry, Error, MountPoint, Result};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Default number of file systems kept mounted.
pub const DEFAULT_MAX_MOUNTED: usize = 5;

/// Default time eviction waits for streams of other threads to close.
pub const DEFAULT_EVICTION_TIMEOUT_MS: u64 = 100;

/// Snapshot of the manager's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagerStats {
    pub total: usize,
    pub mounted: usize,
    /// Mounted file systems in access order, not counting queued victims.
    pub active: usize,
    pub top_level_total: usize,
    pub top_level_mounted: usize,
    pub max_mounted: usize,
    pub queued_for_eviction: usize,
}

/// Mounted file systems in access order.
#[derive(Default)]
struct MountedSet {
    order: BTreeMap<u64, MountPoint>,
    index: HashMap<MountPoint, u64>,
    tick: u64,
}

impl MountedSet {
    /// Make `mount_point` the most recently used record.
    fn touch(&mut self, mount_point: &MountPoint) {
        if let Some(old) = self.index.remove(mount_point) {
            self.order.remove(&old);
        }
        self.tick += 1;
        self.order.insert(self.tick, mount_point.clone());
        self.index.insert(mount_point.clone(), self.tick);
    }

    fn remove(&mut self, mount_point: &MountPoint) -> bool {
        match self.index.remove(mount_point) {
            Some(tick) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    fn pop_eldest(&mut self) -> Option<MountPoint> {
        let (_, eldest) = self.order.pop_first()?;
        self.index.remove(&eldest);
        Some(eldest)
    }

    fn contains(&self, mount_point: &MountPoint) -> bool {
        self.index.contains_key(mount_point)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

/// Keeps at most `max_mounted` file systems mounted, evicting the least
/// recently used ones.
pub struct EvictingManager {
    controllers: RwLock<BTreeMap<MountPoint, Arc<dyn Controller>>>,
    mounted: RwLock<MountedSet>,
    evicted: Mutex<VecDeque<MountPoint>>,
    /// Victims being synchronized right now.
    evicting: Mutex<Vec<MountPoint>>,
    max_mounted: AtomicUsize,
    eviction_timeout_ms: AtomicU64,
}

impl EvictingManager {
    /// Create a manager keeping at most `max_mounted` file systems mounted.
    pub fn new(max_mounted: usize) -> Result<Self> {
        check_max_mounted(max_mounted)?;
        Ok(Self {
            controllers: RwLock::new(BTreeMap::new()),
            mounted: RwLock::new(MountedSet::default()),
            evicted: Mutex::new(VecDeque::new()),
            evicting: Mutex::new(Vec::new()),
            max_mounted: AtomicUsize::new(max_mounted),
            eviction_timeout_ms: AtomicU64::new(DEFAULT_EVICTION_TIMEOUT_MS),
        })
    }

    /// Manage `controller` and return it wrapped for pacing.
    ///
    /// If a controller is already registered for the same mount point, that
    /// one is kept and returned instead.
    pub fn register(self: &Arc<Self>, controller: Arc<dyn Controller>) -> Arc<PacedController> {
        let inner = self
            .controllers
            .write()
            .entry(controller.mount_point().clone())
            .or_insert(controller)
            .clone();
        self.pace(inner)
    }

    pub fn get(self: &Arc<Self>, mount_point: &MountPoint) -> Option<Arc<PacedController>> {
        let inner = self.controllers.read().get(mount_point).cloned()?;
        Some(self.pace(inner))
    }

    /// Stop managing the controller for `mount_point` without syncing it.
    pub fn unregister(&self, mount_point: &MountPoint) -> Option<Arc<dyn Controller>> {
        let removed = self.controllers.write().remove(mount_point);
        self.mounted.write().remove(mount_point);
        self.evicted.lock().retain(|queued| queued != mount_point);
        removed
    }

    fn pace(self: &Arc<Self>, inner: Arc<dyn Controller>) -> Arc<PacedController> {
        Arc::new(PacedController {
            inner,
            manager: Arc::downgrade(self),
        })
    }

    /// Record an access to `controller`.
    ///
    /// A mounted controller becomes the most recently used one. Records beyond
    /// the limit are queued for eviction, eldest first. Accesses made while
    /// the controller's family is being evicted are not recorded.
    pub fn accessed(&self, controller: &dyn Controller) {
        if !controller.is_mounted() {
            return;
        }
        let mount_point = controller.mount_point();
        if self
            .evicting
            .lock()
            .iter()
            .any(|victim| mount_point.is_within(victim))
        {
            return;
        }
        let mut mounted = self.mounted.write();
        mounted.touch(mount_point);
        self.trim(&mut mounted);
    }

    fn trim(&self, mounted: &mut MountedSet) {
        let max = self.max_mounted();
        while mounted.len() > max {
            let Some(eldest) = mounted.pop_eldest() else {
                break;
            };
            debug!("queueing {} for eviction", eldest);
            self.evicted.lock().push_back(eldest);
        }
    }

    /// Evict queued file systems, sparing `mount_point` and everything in use.
    ///
    /// Victims whose streams stay open are queued again. Warnings are logged;
    /// fatal failures are returned.
    pub fn retain(&self, mount_point: &MountPoint) -> std::result::Result<(), SyncError> {
        let queue: Vec<MountPoint> = self.evicted.lock().drain(..).collect();
        if queue.is_empty() {
            return Ok(());
        }

        let options = SyncOptions::EVICT.with_timeout_ms(self.eviction_timeout_ms());
        let mut errors = SyncError::new();
        let mut requeue = Vec::new();
        for victim in queue {
            let family = self.family(&victim);
            let busy = {
                let mounted = self.mounted.read();
                family.iter().any(|controller| {
                    controller.mount_point() == mount_point
                        || mounted.contains(controller.mount_point())
                })
            };
            if busy {
                if &victim != mount_point && !self.mounted.read().contains(&victim) {
                    requeue.push(victim);
                }
                continue;
            }
            debug!("evicting {}", victim);
            match self.evict(&victim, &family, &options) {
                Ok(()) => {}
                Err(err) if err.is_busy() => {
                    debug!("{} is still in use: {}", victim, err);
                    requeue.push(victim);
                }
                Err(err) => errors.extend(err),
            }
        }
        if !requeue.is_empty() {
            self.evicted.lock().extend(requeue);
        }

        if errors.is_fatal() {
            return Err(errors);
        }
        if !errors.is_empty() {
            warn!("{}", errors);
        }
        Ok(())
    }

    /// Synchronize `family`, children first, stopping at a member still in use.
    fn evict(
        &self,
        victim: &MountPoint,
        family: &[Arc<dyn Controller>],
        options: &SyncOptions,
    ) -> std::result::Result<(), SyncError> {
        self.evicting.lock().push(victim.clone());
        let mut errors = SyncError::new();
        for controller in family {
            let result = controller.sync(options);
            self.synced(&**controller);
            if let Err(err) = result {
                errors.extend(err);
                if errors.is_busy() {
                    break;
                }
            }
        }
        let mut evicting = self.evicting.lock();
        if let Some(at) = evicting.iter().position(|queued| queued == victim) {
            evicting.swap_remove(at);
        }
        errors.into_result()
    }

    /// Synchronize every managed file system, nested ones before their parents.
    ///
    /// Eviction and access bookkeeping is reset afterwards even on failure.
    pub fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError> {
        let all: Vec<Arc<dyn Controller>> =
            self.controllers.read().values().rev().cloned().collect();
        let errors = self.sync_all(&all, options);
        self.mounted.write().clear();
        self.evicted.lock().clear();
        errors.into_result()
    }

    fn sync_all(&self, controllers: &[Arc<dyn Controller>], options: &SyncOptions) -> SyncError {
        let mut errors = SyncError::new();
        for controller in controllers {
            if let Err(err) = controller.sync(options) {
                errors.extend(err);
            }
            self.synced(&**controller);
        }
        errors
    }

    /// Drop the access record of `controller` once it is no longer mounted.
    fn synced(&self, controller: &dyn Controller) {
        if !controller.is_mounted() {
            self.mounted.write().remove(controller.mount_point());
        }
    }

    /// `victim` and every managed file system nested in it, children first.
    fn family(&self, victim: &MountPoint) -> Vec<Arc<dyn Controller>> {
        self.controllers
            .read()
            .iter()
            .rev()
            .filter(|(mount_point, _)| mount_point.is_within(victim))
            .map(|(_, controller)| controller.clone())
            .collect()
    }

    pub fn max_mounted(&self) -> usize {
        self.max_mounted.load(Ordering::SeqCst)
    }

    /// Change the limit. Excess records are queued for eviction at once.
    pub fn set_max_mounted(&self, max_mounted: usize) -> Result<()> {
        check_max_mounted(max_mounted)?;
        self.max_mounted.store(max_mounted, Ordering::SeqCst);
        let mut mounted = self.mounted.write();
        self.trim(&mut mounted);
        Ok(())
    }

    pub fn eviction_timeout_ms(&self) -> u64 {
        self.eviction_timeout_ms.load(Ordering::SeqCst)
    }

    /// How long eviction waits for streams of other threads; zero waits indefinitely.
    pub fn set_eviction_timeout_ms(&self, timeout_ms: u64) {
        self.eviction_timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    pub fn total_count(&self) -> usize {
        self.controllers.read().len()
    }

    /// Number of managed file systems currently mounted.
    ///
    /// Queued victims still count until they have been evicted.
    pub fn mounted_count(&self) -> usize {
        self.controllers
            .read()
            .values()
            .filter(|controller| controller.is_mounted())
            .count()
    }

    /// Number of mounted file systems in access order; never above the limit.
    pub fn active_count(&self) -> usize {
        self.mounted.read().len()
    }

    pub fn top_level_total_count(&self) -> usize {
        self.controllers
            .read()
            .keys()
            .filter(|mount_point| mount_point.is_top_level())
            .count()
    }

    pub fn top_level_mounted_count(&self) -> usize {
        self.controllers
            .read()
            .values()
            .filter(|controller| controller.mount_point().is_top_level() && controller.is_mounted())
            .count()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            total: self.total_count(),
            mounted: self.mounted_count(),
            active: self.active_count(),
            top_level_total: self.top_level_total_count(),
            top_level_mounted: self.top_level_mounted_count(),
            max_mounted: self.max_mounted(),
            queued_for_eviction: self.evicted.lock().len(),
        }
    }
}

fn check_max_mounted(max_mounted: usize) -> Result<()> {
    if max_mounted < 1 {
        return Err(Error::InvalidArgument(format!(
            "max_mounted must be at least 1, got {}",
            max_mounted
        )));
    }
    Ok(())
}

/// A controller whose operations are paced by an [`EvictingManager`].
pub struct PacedController {
    inner: Arc<dyn Controller>,
    manager: Weak<EvictingManager>,
}

impl PacedController {
    /// The controller being paced.
    pub fn inner(&self) -> &Arc<dyn Controller> {
        &self.inner
    }

    /// The same controller, recording accesses without evicting first.
    ///
    /// File systems nested in this one read and write it through the
    /// returned controller, which may happen while an eviction is running.
    pub fn recording(&self) -> Arc<dyn Controller> {
        Arc::new(RecordingController {
            inner: self.inner.clone(),
            manager: self.manager.clone(),
        })
    }

    fn pace<T>(&self, op: impl FnOnce(&dyn Controller) -> Result<T>) -> Result<T> {
        let manager = self.manager.upgrade();
        if let Some(manager) = &manager {
            manager.retain(self.inner.mount_point())?;
        }
        let result = op(&*self.inner);
        if let Some(manager) = &manager {
            manager.accessed(&*self.inner);
        }
        result
    }
}

impl Controller for PacedController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn input(&self, name: &str) -> Result<SharedInput> {
        self.pace(|controller| controller.input(name))
    }

    fn output(&self, name: &str) -> Result<SharedOutput> {
        self.pace(|controller| controller.output(name))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        self.pace(|controller| controller.entries())
    }

    fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError> {
        let result = self.inner.sync(options);
        if let Some(manager) = self.manager.upgrade() {
            manager.synced(&*self.inner);
        }
        result
    }
}

/// A controller whose accesses are recorded by an [`EvictingManager`].
struct RecordingController {
    inner: Arc<dyn Controller>,
    manager: Weak<EvictingManager>,
}

impl RecordingController {
    fn record<T>(&self, op: impl FnOnce(&dyn Controller) -> Result<T>) -> Result<T> {
        let result = op(&*self.inner);
        if let Some(manager) = self.manager.upgrade() {
            manager.accessed(&*self.inner);
        }
        result
    }
}

impl Controller for RecordingController {
    fn mount_point(&self) -> &MountPoint {
        self.inner.mount_point()
    }

    fn is_mounted(&self) -> bool {
        self.inner.is_mounted()
    }

    fn input(&self, name: &str) -> Result<SharedInput> {
        self.record(|controller| controller.input(name))
    }

    fn output(&self, name: &str) -> Result<SharedOutput> {
        self.record(|controller| controller.output(name))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        self.record(|controller| controller.entries())
    }

    fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError> {
        let result = self.inner.sync(options);
        if let Some(manager) = self.manager.upgrade() {
            manager.synced(&*self.inner);
        }
        result
    }
}
