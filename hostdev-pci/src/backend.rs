//! Collaborator traits for talking to PCI sysfs and the netdev layer.
//!
//! `hostdev-manager` depends on these traits, not on a concrete backend, so
//! that the pipeline's phase ordering and rollback logic can be unit tested
//! against a fake implementation, the same way a driver registry is often
//! exercised through a `match_fn`/`probe` pair of function pointers rather
//! than a concrete device.

use std::path::PathBuf;

use hostdev_types::{HostdevError, PciAddress, PciDevice, VirtPortProfile};

/// PCI sysfs driver-binding and discovery primitives.
pub trait PciBackend: Send + Sync {
    /// Whether `dev` may be assigned to a guest at all (driver not in use
    /// by the host, ACS isolation satisfied if `strict_acs` is set).
    fn is_assignable(&self, addr: PciAddress, strict_acs: bool) -> bool;

    /// Detach `dev` from its current host driver and bind it to
    /// `dev.stub_driver`. Records `dev.orig_states` on success.
    fn detach(&self, dev: &mut PciDevice) -> Result<(), HostdevError>;

    /// Reset `dev`. `siblings` lists every other address currently active
    /// or inactive-but-manager-owned, so a secondary-bus reset can be
    /// rejected or deferred when it would disturb a device this pipeline
    /// doesn't itself hold.
    fn reset(&self, dev: &PciDevice, siblings: &[PciAddress]) -> Result<(), HostdevError>;

    /// Unbind `dev` from its stub driver. This does **not** rebind the
    /// original host driver — only the stub binding is removed.
    fn reattach(&self, dev: &PciDevice) -> Result<(), HostdevError>;

    /// Poll whether `attr` still exists under `dev`'s sysfs directory.
    /// Returns `true` while it is still present (i.e. cleanup is not yet
    /// done).
    fn wait_for_cleanup(&self, dev: &PciDevice, attr: &str) -> bool;

    /// The sysfs directory for `addr` (e.g.
    /// `/sys/bus/pci/devices/0000:03:00.0`).
    fn sysfs_path(&self, addr: PciAddress) -> PathBuf;

    /// Whether `addr` is an SR-IOV virtual function.
    fn is_virtual_function(&self, addr: PciAddress) -> Result<bool, HostdevError>;

    /// For a virtual function, its physical function's netdev name and its
    /// VF index.
    fn get_vf_info(&self, addr: PciAddress) -> Result<(String, u32), HostdevError>;

    /// The netdev name bound to a (non-VF) network PCI function.
    fn get_netname(&self, addr: PciAddress) -> Result<String, HostdevError>;
}

/// Network-device-layer collaborator: MAC/VLAN and virtualport association
/// for an SR-IOV VF.
pub trait NetdevBackend: Send + Sync {
    /// Apply `mac`/`vlan` to `pf`'s VF `vf` (or to `pf` itself if `vf` is
    /// `None`), after first capturing the current configuration so it can
    /// be restored later.
    fn replace_config(
        &self,
        pf: &str,
        vf: Option<u32>,
        mac: [u8; 6],
        vlan: Option<u16>,
        state_dir: &std::path::Path,
    ) -> Result<(), HostdevError>;

    /// Re-apply the configuration most recently captured by
    /// `replace_config` for `pf`/`vf`.
    fn restore_config(
        &self,
        pf: &str,
        vf: Option<u32>,
        state_dir: &std::path::Path,
    ) -> Result<(), HostdevError>;

    /// Associate `linkdev`/`vf` with an 802.1Qbh virtualport profile.
    fn virtport_associate(
        &self,
        linkdev: &str,
        vf: Option<u32>,
        profile: &VirtPortProfile,
        mac: [u8; 6],
        domain_uuid: Option<&str>,
    ) -> Result<(), HostdevError>;

    /// Reverse of [`NetdevBackend::virtport_associate`].
    fn virtport_disassociate(
        &self,
        linkdev: &str,
        vf: Option<u32>,
        profile: &VirtPortProfile,
        mac: [u8; 6],
    ) -> Result<(), HostdevError>;
}
