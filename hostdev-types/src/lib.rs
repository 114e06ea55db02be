//! Data model for the host-device assignment manager.
//!
//! Single source of truth for the address, descriptor and error types shared
//! by [`hostdev-pci`](../hostdev_pci/index.html) and
//! [`hostdev-manager`](../hostdev_manager/index.html).

pub mod address;
pub mod descriptor;
pub mod device;
pub mod error;

pub use address::PciAddress;
pub use descriptor::{
    HostdevDescriptor, HostdevMode, NetParent, NetVlan, SubsysType, VirtPortProfile, VirtPortType,
};
pub use device::{OrigStates, PciDevice, StubDriver, UsedBy};
pub use error::HostdevError;
