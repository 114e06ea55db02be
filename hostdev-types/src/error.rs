//! Error taxonomy for host-device assignment.
//!
//! Mirrors the `#[derive(thiserror::Error)]` style used throughout the
//! example pack's device-manager code (e.g. `dragonball`'s
//! `VfioDeviceError`, `firecracker`'s `DeviceManagerCreateError`): one
//! variant per distinguishable failure, carrying exactly the context needed
//! to render a useful message.

use crate::address::PciAddress;
use thiserror::Error;

/// Config rejections, invalid operations, and collaborator I/O failures.
#[derive(Debug, Error)]
pub enum HostdevError {
    // ---- ConfigUnsupported ----
    /// Virtualport type not supported for an `interface type='hostdev'`.
    #[error("virtualport type {0} is currently not supported on interfaces of type hostdev")]
    VirtPortTypeUnsupported(&'static str),

    /// A virtualport profile and a direct VLAN tag were both supplied.
    #[error(
        "direct setting of the vlan tag is not allowed for hostdev devices using {0} mode"
    )]
    VlanWithVirtPort(&'static str),

    /// VLAN trunking (more than one tag, or `trunk=true`) requested on an
    /// SR-IOV network device.
    #[error("vlan trunking is not supported by SR-IOV network devices")]
    VlanTrunkingUnsupported,

    /// VLAN requested on a PCI function that is not an SR-IOV VF.
    #[error("vlan can only be set for SR-IOV VFs, but {0} is not a VF")]
    VlanOnNonVf(String),

    /// The PCI function is not an SR-IOV virtual function at all.
    #[error("interface type hostdev is currently supported on SR-IOV Virtual Functions only")]
    NotAVirtualFunction,

    // ---- OperationInvalid ----
    /// `pci_is_assignable` returned false.
    #[error("PCI device {0} is not assignable")]
    NotAssignable(PciAddress),

    /// The device is already present in the active registry.
    #[error("PCI device {addr} is in use by driver {driver}, domain {domain}")]
    InUse {
        addr: PciAddress,
        driver: String,
        domain: String,
    },

    /// The device is active but has no recorded attribution (shouldn't
    /// happen given the active-registry invariant, but the original
    /// tolerates it and reports a degraded message).
    #[error("PCI device {0} is already in use")]
    InUseUnknownOwner(PciAddress),

    /// Two entries in the same prepare batch share an address. Caught
    /// while building the working list, before anything has been touched.
    #[error("PCI device {0} is listed more than once in this request")]
    DuplicateInBatch(PciAddress),

    // ---- OperationFailed ----
    /// The manager's state directory could not be created.
    #[error("failed to create state dir '{0}'")]
    StateDirCreate(String, #[source] std::io::Error),

    /// A registry insert failed (e.g. capacity/consistency violation).
    #[error("failed to add PCI device {0} to registry")]
    RegistryInsertFailed(PciAddress),

    // ---- collaborator primitive failures (surfaced as OperationFailed) ----
    #[error("failed to detach PCI device {0} from host driver")]
    DetachFailed(PciAddress, #[source] std::io::Error),

    #[error("failed to reset PCI device {0}")]
    ResetFailed(PciAddress, #[source] std::io::Error),

    #[error("failed to reattach PCI device {0}")]
    ReattachFailed(PciAddress, #[source] std::io::Error),

    #[error("failed to read sysfs state for PCI device {0}")]
    SysfsIo(PciAddress, #[source] std::io::Error),

    #[error("failed to save/restore VF network config for {pf} vf {vf:?}")]
    NetConfigIo {
        pf: String,
        vf: Option<u32>,
        #[source]
        source: std::io::Error,
    },
}
