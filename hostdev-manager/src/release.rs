//! The PCI release pipeline and the per-device reattach helper.
//!
//! Grounded in libvirt's `virHostdevReAttachPCIDevices` /
//! `virHostdevReattachPciDevice`. Release is best-effort: it is invoked
//! from guest teardown paths that cannot meaningfully abort, so every
//! sub-failure is logged at `error!` and suppressed rather than
//! propagated.

use std::path::Path;
use std::thread;

use log::error;

use hostdev_pci::{NetConfigStore, NetdevBackend, PciBackend};
use hostdev_types::{HostdevDescriptor, PciDevice};

use crate::config::ManagerConfig;
use crate::manager::HostdevManager;
use crate::registry::vec_steal_if;

/// Detach `hostdevs` from `(driver_name, domain_name)`, returning their
/// devices to the host driver. Never propagates an error; `legacy_state_dir`
/// is consulted on a VF-net-config read-miss for upgrade-from-prior-install
/// support.
#[allow(clippy::too_many_arguments)]
pub fn release_pci(
    mgr: &HostdevManager,
    pci: &dyn PciBackend,
    netdev: &dyn NetdevBackend,
    net_config: &NetConfigStore,
    driver_name: &str,
    domain_name: &str,
    hostdevs: &[HostdevDescriptor],
    legacy_state_dir: Option<&Path>,
) {
    let mut active = mgr.active_pci().lock();
    let mut inactive = mgr.inactive_pci().lock();

    // Phases 1+2: build `W` from the active registry's entries matching
    // the requested addresses, keeping only the ones this (driver, domain)
    // actually owns; devices owned by another guest, or not active at all,
    // are left untouched.
    let addrs: Vec<_> = hostdevs
        .iter()
        .filter(|hd| hd.is_pci_subsys())
        .map(|hd| hd.addr)
        .collect();

    let mut w: Vec<PciDevice> = Vec::new();
    for addr in &addrs {
        // Steals the active entry only when it's attributed to the
        // releasing (driver, domain) pair; a device belonging to another
        // guest, or carrying no attribution at all, is left untouched.
        if let Some(d) = vec_steal_if(&mut active, addr, |d| {
            d.used_by
                .as_ref()
                .map(|u| u.matches(driver_name, domain_name))
                .unwrap_or(false)
        }) {
            w.push(d);
        }
    }

    // Phase 3: restore VF net config for every requested hostdev with a
    // Net parent, independent of whether its device ended up in `W` — this
    // mirrors the original, which restores net config for the full
    // hostdev list rather than gating it on active-registry membership.
    for hd in hostdevs {
        if !hd.is_pci_subsys() {
            continue;
        }
        if let Some(net) = &hd.net_parent {
            if let Err(e) = net_config.restore(netdev, pci, hd.addr, net, legacy_state_dir) {
                error!("failed to restore VF net config for {}: {e}", hd.addr);
            }
        }
    }

    // Phase 4: reset every device being released.
    let siblings: Vec<_> = active.iter().chain(inactive.iter()).map(PciDevice::addr).collect();
    for d in &w {
        if let Err(e) = pci.reset(d, &siblings) {
            error!("failed to reset {} during release: {e}", d.addr());
        }
    }

    // Phase 5: drain `W`, handing each device back to the host driver.
    for d in w.drain(..) {
        reattach_one(pci, mgr.config(), &mut inactive, d);
    }
}

/// Per-device reattach helper.
///
/// Consumes `dev`: every branch ends by dropping it, whether it was handed
/// to the inactive registry or just unbound from its stub.
fn reattach_one(
    pci: &dyn PciBackend,
    config: &ManagerConfig,
    inactive: &mut Vec<PciDevice>,
    dev: PciDevice,
) {
    if !dev.managed {
        // The device was never manager-owned in the driver-binding sense;
        // it was pre-bound by the administrator and is "inactive" in our
        // sense from the moment it stops being assigned.
        let addr = dev.addr();
        if crate::registry::vec_insert(inactive, dev).is_err() {
            error!("device {addr} already present in inactive registry, dropping");
        }
        return;
    }

    use hostdev_types::StubDriver;
    if dev.stub_driver == StubDriver::PciStub {
        // The device-assignment subsystem may asynchronously hold a
        // reference just after guest teardown; poll for it to clear
        // before reattaching. The Vfio path has no such out-of-band
        // reference and reattaches immediately.
        let mut retries = config.reattach_poll_retries;
        while retries > 0 && pci.wait_for_cleanup(&dev, "kvm_assigned_device") {
            thread::sleep(config.reattach_poll_interval);
            retries -= 1;
        }
    }

    if let Err(e) = pci.reattach(&dev) {
        error!("failed to reattach PCI device {}: {e}", dev.addr());
    }
}
