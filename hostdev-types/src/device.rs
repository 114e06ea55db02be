//! The assignment metadata carried on a PCI function handle.

use crate::address::PciAddress;

/// The host stub driver a device is bound to while assigned to a guest.
///
/// Chosen per-device from the owning `HostdevDescriptor`'s `stub_driver`
/// field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubDriver {
    VfioPci,
    PciStub,
}

impl StubDriver {
    /// The sysfs/modprobe driver name, as used by `pci_detach`/`pci_reattach`.
    pub fn driver_name(self) -> &'static str {
        match self {
            StubDriver::VfioPci => "vfio-pci",
            StubDriver::PciStub => "pci-stub",
        }
    }
}

/// Binding state captured by the detach primitive, read back into the
/// hostdev descriptor once a prepare attempt commits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrigStates {
    pub unbind_from_stub: bool,
    pub remove_slot: bool,
    pub reprobe: bool,
}

/// The (driver-name, domain-name) attribution of the guest that owns a
/// device currently in the active registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsedBy {
    pub driver_name: String,
    pub domain_name: String,
}

impl UsedBy {
    pub fn new(driver_name: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            domain_name: domain_name.into(),
        }
    }

    pub fn matches(&self, driver_name: &str, domain_name: &str) -> bool {
        self.driver_name == driver_name && self.domain_name == domain_name
    }
}

/// An owned handle to a specific PCI function, tagged with assignment
/// metadata.
///
/// Invariant: a `PciDevice` belongs to at most one of {active registry,
/// inactive registry, a transient caller-owned working list} at a time.
/// `Clone` exists because the release pipeline copies registry entries into
/// its working list before deleting the registry's own copy, mirroring
/// `virPCIDeviceListAddCopy` in libvirt's hostdev manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PciDevice {
    addr: PciAddress,
    pub managed: bool,
    pub stub_driver: StubDriver,
    pub orig_states: OrigStates,
    pub used_by: Option<UsedBy>,
}

impl PciDevice {
    pub fn new(addr: PciAddress, managed: bool, stub_driver: StubDriver) -> Self {
        Self {
            addr,
            managed,
            stub_driver,
            orig_states: OrigStates::default(),
            used_by: None,
        }
    }

    #[inline]
    pub fn addr(&self) -> PciAddress {
        self.addr
    }
}
