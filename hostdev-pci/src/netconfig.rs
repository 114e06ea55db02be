//! SR-IOV VF network config save/restore, grounded in
//! `virHostdevNetConfigReplace`/`virHostdevNetConfigRestore` from libvirt's
//! hostdev manager.

use std::path::{Path, PathBuf};

use hostdev_types::{HostdevError, NetParent, PciAddress, VirtPortType};
use log::debug;

use crate::backend::{NetdevBackend, PciBackend};

/// Filesystem-backed save/restore of a physical function's VF network
/// state, rooted at the manager's state directory.
///
/// The actual file format is opaque here — persistence is delegated to the
/// [`NetdevBackend`] implementation. This type owns only the rooting
/// directory and the legacy-fallback policy.
#[derive(Clone, Debug)]
pub struct NetConfigStore {
    state_dir: PathBuf,
}

impl NetConfigStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Apply the guest's requested VF network config for `hostdev`,
    /// validating the virtualport/VLAN combination first.
    ///
    /// `domain_uuid` is threaded through to `virtport_associate` so a
    /// 802.1Qbh switch can tie the association to the owning domain.
    pub fn prepare(
        &self,
        netdev: &dyn NetdevBackend,
        pci: &dyn PciBackend,
        addr: PciAddress,
        net: &NetParent,
        domain_uuid: Option<&str>,
    ) -> Result<(), HostdevError> {
        if !pci.is_virtual_function(addr)? {
            return Err(HostdevError::NotAVirtualFunction);
        }
        let (linkdev, vf) = pci.get_vf_info(addr)?;
        let vf = Some(vf);

        if let Some(virt_port) = &net.virt_port {
            if net.vlan.is_some() {
                return Err(HostdevError::VlanWithVirtPort(virt_port.virt_port_type.name()));
            }
            if virt_port.virt_port_type != VirtPortType::Qbh8021 {
                return Err(HostdevError::VirtPortTypeUnsupported(virt_port.virt_port_type.name()));
            }
            debug!("associating virtualport profile on {linkdev} vf {vf:?}");
            return netdev.virtport_associate(&linkdev, vf, virt_port, net.mac, domain_uuid);
        }

        let vlan_id = match &net.vlan {
            Some(vlan) => {
                if vlan.tags.len() != 1 || vlan.trunk {
                    return Err(HostdevError::VlanTrunkingUnsupported);
                }
                if vf.is_none() {
                    return Err(HostdevError::VlanOnNonVf(linkdev));
                }
                Some(vlan.tags[0])
            }
            // No VLAN requested: reset any stale tag on a VF.
            None => vf.map(|_| 0u16),
        };

        netdev.replace_config(&linkdev, vf, net.mac, vlan_id, &self.state_dir)
    }

    /// Undo [`NetConfigStore::prepare`], retrying at `legacy_dir` on a
    /// read-miss in the current state directory (upgrade-from-prior-install
    /// support).
    pub fn restore(
        &self,
        netdev: &dyn NetdevBackend,
        pci: &dyn PciBackend,
        addr: PciAddress,
        net: &NetParent,
        legacy_dir: Option<&Path>,
    ) -> Result<(), HostdevError> {
        if !pci.is_virtual_function(addr)? {
            return Err(HostdevError::NotAVirtualFunction);
        }
        let (linkdev, vf) = pci.get_vf_info(addr)?;
        let vf = Some(vf);

        if let Some(virt_port) = &net.virt_port {
            return netdev.virtport_disassociate(&linkdev, vf, virt_port, net.mac);
        }

        match netdev.restore_config(&linkdev, vf, &self.state_dir) {
            Ok(()) => Ok(()),
            Err(primary_err) => match legacy_dir {
                Some(legacy) => netdev.restore_config(&linkdev, vf, legacy).map_err(|_| primary_err),
                None => Err(primary_err),
            },
        }
    }
}
