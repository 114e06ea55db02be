//! The hostdev descriptor consumed from the domain-XML layer (parsing that
//! XML is out of scope for this crate) and handed to the prepare/release
//! pipelines.

use crate::address::PciAddress;
use crate::device::{OrigStates, StubDriver};

/// `<hostdev mode="...">` — only `Subsys` entries are processed by the PCI
/// pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostdevMode {
    Subsys,
    Capabilities,
}

/// `<hostdev><source><address type="...">` — only `Pci` entries are
/// processed by this pipeline; `Usb`/`Scsi` are peers handled elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubsysType {
    Pci,
    Usb,
    Scsi,
}

/// 802.1Qbg/Qbh virtualport type. Only `Qbh8021` is accepted by
/// [`hostdev-pci`'s](../hostdev_pci/index.html) `NetConfigStore`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtPortType {
    None,
    OpenVSwitch,
    Qbg8021,
    Qbh8021,
}

impl VirtPortType {
    pub fn name(self) -> &'static str {
        match self {
            VirtPortType::None => "none",
            VirtPortType::OpenVSwitch => "openvswitch",
            VirtPortType::Qbg8021 => "802.1Qbg",
            VirtPortType::Qbh8021 => "802.1Qbh",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtPortProfile {
    pub virt_port_type: VirtPortType,
}

/// A single VLAN tag, or a trunk of several (only a single tag is supported
/// by SR-IOV VFs).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetVlan {
    pub tags: Vec<u16>,
    pub trunk: bool,
}

/// The `Net`-kind parent of a hostdev whose `<interface type="hostdev">`
/// binds this PCI function to a guest network interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetParent {
    pub mac: [u8; 6],
    pub vlan: Option<NetVlan>,
    pub virt_port: Option<VirtPortProfile>,
}

/// One `<hostdev>` entry from the domain definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostdevDescriptor {
    pub mode: HostdevMode,
    pub subsys_type: SubsysType,
    pub addr: PciAddress,
    pub managed: bool,
    pub stub_driver: StubDriver,
    /// Present when this hostdev is also the backing device of a guest
    /// network interface (`<interface type="hostdev">`).
    pub net_parent: Option<NetParent>,
    /// Written back by `prepare_pci` once the detach step commits.
    pub orig_states: OrigStates,
}

impl HostdevDescriptor {
    /// Whether this entry is processed by the PCI prepare/release pipeline:
    /// mode must be `Subsys` and subsys type must be `Pci`.
    pub fn is_pci_subsys(&self) -> bool {
        self.mode == HostdevMode::Subsys && self.subsys_type == SubsysType::Pci
    }
}
