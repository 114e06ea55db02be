//! Mutex-protected device registries.
//!
//! Each registry is a set keyed by the item's identity, guarded by its own
//! [`std::sync::Mutex`] — the hosted analogue of a kernel's `IrqMutex`
//! ticket lock (there is no interrupt context here, only ordinary threads).
//! The mutex protects membership only; it does not protect a contained
//! item's own fields once the item has been handed out via
//! [`DeviceRegistry::find`] or [`DeviceRegistry::steal`].

use std::sync::{Mutex, MutexGuard};

use hostdev_types::{PciAddress, PciDevice, UsedBy};

/// A type with a stable identity usable as a registry key.
pub trait Keyed {
    type Key: Eq + Clone + std::fmt::Debug;

    fn key(&self) -> Self::Key;
}

impl Keyed for PciDevice {
    type Key = PciAddress;

    fn key(&self) -> PciAddress {
        self.addr()
    }
}

/// A mutex-protected set of devices, keyed by [`Keyed::key`].
///
/// Insertion order is preserved purely so tests can assert deterministic
/// iteration; nothing here depends on it for correctness, since registry
/// operations are rare (guest boot/stop) and a linear scan over a handful
/// of entries is not a performance concern.
pub struct DeviceRegistry<T: Keyed> {
    inner: Mutex<Vec<T>>,
}

impl<T: Keyed> DeviceRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Acquire the registry's mutex for the duration of a multi-phase
    /// pipeline: the active-PCI and inactive-PCI mutexes are acquired
    /// together and held for the entire duration of prepare and release.
    /// Single, short-lived operations should prefer the convenience methods
    /// below instead of holding the guard directly.
    pub fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        vec_contains(&self.lock(), key)
    }

    pub fn find(&self, key: &T::Key) -> Option<T>
    where
        T: Clone,
    {
        vec_find(&self.lock(), key)
    }

    /// Insert `item`, rejecting a duplicate key rather than replacing it —
    /// a duplicate implies a caller bug. Returns the item back on
    /// rejection so the caller can report a precise error.
    pub fn insert(&self, item: T) -> Result<(), T> {
        vec_insert(&mut self.lock(), item)
    }

    /// Remove and return the entry for `key`, transferring ownership out.
    pub fn steal(&self, key: &T::Key) -> Option<T> {
        vec_steal(&mut self.lock(), key)
    }

    /// Remove and drop the entry for `key`. No-op if absent.
    pub fn delete(&self, key: &T::Key) {
        vec_steal(&mut self.lock(), key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A snapshot of every key currently held, in insertion order.
    pub fn keys(&self) -> Vec<T::Key> {
        self.lock().iter().map(Keyed::key).collect()
    }
}

impl<T: Keyed> Default for DeviceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Free functions operating directly on a `Vec<T>` guard, used both by the
// convenience methods above (short critical section) and by the prepare/
// release pipelines, which acquire the guard once and hold it across all
// nine phases.

pub fn vec_contains<T: Keyed>(v: &[T], key: &T::Key) -> bool {
    v.iter().any(|item| &item.key() == key)
}

pub fn vec_find<T: Keyed + Clone>(v: &[T], key: &T::Key) -> Option<T> {
    v.iter().find(|item| &item.key() == key).cloned()
}

pub fn vec_insert<T: Keyed>(v: &mut Vec<T>, item: T) -> Result<(), T> {
    if vec_contains(v, &item.key()) {
        return Err(item);
    }
    v.push(item);
    Ok(())
}

pub fn vec_steal<T: Keyed>(v: &mut Vec<T>, key: &T::Key) -> Option<T> {
    let idx = v.iter().position(|item| &item.key() == key)?;
    Some(v.remove(idx))
}

/// Find the entry for `key` and, if `pred` accepts it, remove and return it;
/// otherwise leave `v` untouched. Used by the release pipeline to build its
/// working list from the active registry: a requested address is stolen out
/// only when it's owned by the releasing (driver, domain) pair, matching
/// `virHostdevGetActivePciHostDeviceList`'s find-then-filter-by-ownership
/// step.
pub fn vec_steal_if<T: Keyed>(v: &mut Vec<T>, key: &T::Key, pred: impl FnOnce(&T) -> bool) -> Option<T> {
    let idx = v.iter().position(|item| &item.key() == key)?;
    if pred(&v[idx]) {
        Some(v.remove(idx))
    } else {
        None
    }
}

/// Minimal USB device identity. The USB registry is a peer sharing the
/// manager's lifecycle; its device-specific binding logic is out of scope
/// here, so this is only enough shape to instantiate [`DeviceRegistry`]
/// for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbAddress {
    pub bus: u8,
    pub device: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbDevice {
    pub addr: UsbAddress,
    pub used_by: Option<UsedBy>,
}

impl Keyed for UsbDevice {
    type Key = UsbAddress;

    fn key(&self) -> UsbAddress {
        self.addr
    }
}

/// Minimal SCSI device identity, same role as [`UsbDevice`] but for the
/// SCSI registry peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScsiAddress {
    pub host: u16,
    pub bus: u8,
    pub target: u16,
    pub unit: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiDevice {
    pub addr: ScsiAddress,
    pub used_by: Option<UsedBy>,
}

impl Keyed for ScsiDevice {
    type Key = ScsiAddress;

    fn key(&self) -> ScsiAddress {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdev_types::StubDriver;

    fn dev(bus: u8) -> PciDevice {
        PciDevice::new(PciAddress::new(0, bus, 0, 0).unwrap(), true, StubDriver::VfioPci)
    }

    #[test]
    fn insert_then_find_round_trips() {
        let reg: DeviceRegistry<PciDevice> = DeviceRegistry::new();
        let addr = dev(3).addr();
        reg.insert(dev(3)).unwrap();
        assert!(reg.contains(&addr));
        assert_eq!(reg.find(&addr).unwrap().addr(), addr);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let reg: DeviceRegistry<PciDevice> = DeviceRegistry::new();
        reg.insert(dev(3)).unwrap();
        let rejected = reg.insert(dev(3));
        assert!(rejected.is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn steal_removes_and_returns_ownership() {
        let reg: DeviceRegistry<PciDevice> = DeviceRegistry::new();
        let addr = dev(3).addr();
        reg.insert(dev(3)).unwrap();
        let stolen = reg.steal(&addr).unwrap();
        assert_eq!(stolen.addr(), addr);
        assert!(!reg.contains(&addr));
    }

    #[test]
    fn delete_is_noop_on_absent_key() {
        let reg: DeviceRegistry<PciDevice> = DeviceRegistry::new();
        reg.delete(&dev(9).addr());
        assert!(reg.is_empty());
    }

    #[test]
    fn steal_if_removes_only_when_predicate_accepts() {
        let mut v = vec![dev(3)];
        let addr = v[0].addr();

        assert!(vec_steal_if(&mut v, &addr, |_| false).is_none());
        assert_eq!(v.len(), 1);

        let stolen = vec_steal_if(&mut v, &addr, |_| true).unwrap();
        assert_eq!(stolen.addr(), addr);
        assert!(v.is_empty());
    }

    #[test]
    fn steal_if_is_noop_on_absent_key() {
        let mut v: Vec<PciDevice> = Vec::new();
        assert!(vec_steal_if(&mut v, &dev(9).addr(), |_| true).is_none());
    }
}
