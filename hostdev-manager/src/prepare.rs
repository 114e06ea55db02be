//! The PCI prepare pipeline: attach a batch of PCI hostdevs to a guest with
//! all-or-nothing semantics.
//!
//! Grounded directly in libvirt's `virHostdevPreparePCIDevices`: nine
//! ordered phases under both registry locks, a single rollback dispatch
//! keyed by which phase failed. Detach and reset are kept as separate
//! phases rather than folded into one loop because a secondary-bus reset
//! can disturb a sibling device that hasn't been detached yet.

use bitflags::bitflags;
use log::warn;

use hostdev_pci::{NetConfigStore, NetdevBackend, PciBackend};
use hostdev_types::{HostdevDescriptor, HostdevError, PciAddress, PciDevice, UsedBy};

use crate::manager::HostdevManager;
use crate::registry::{vec_contains, vec_insert, vec_steal};

bitflags! {
    /// Flags bitmask for [`prepare_pci`]. Currently a single
    /// bit; kept as a bitflags type rather than a bare `bool` so future
    /// flags don't force a signature change, matching the original's
    /// `unsigned int flags` parameter.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PrepareFlags: u32 {
        const STRICT_ACS_CHECK = 1 << 0;
    }
}

/// Which phase a failed prepare attempt reached, determining how much
/// rollback work is needed.
enum FailurePoint {
    /// Phase 2 (detach) or phase 3 (reset) failed. Nothing beyond the
    /// stub-driver binding has happened yet.
    DetachOrReset,
    /// Phase 4 (VF net config) failed after successfully configuring the
    /// hostdevs at index `< i` for some `i`. `last_vf_done` is the index of
    /// the last hostdev processed before the failing one; this
    /// implementation restores it too (`i <= last_vf_done`), resolving an
    /// off-by-one present in the original's rollback loop.
    NetConfig { last_vf_done: Option<usize> },
    /// Phase 5 (insert into active) failed partway through a multi-device
    /// batch. Already-inserted devices have been stolen back into the
    /// working list by the time this variant is returned.
    Insert,
}

/// Attach `hostdevs`' PCI SUBSYS entries to a guest.
///
/// On success, every PCI SUBSYS entry is present in the active registry
/// attributed to `(driver_name, domain_name)`, removed from the inactive
/// registry, and its `orig_states` field has been written back. On
/// failure, the active/inactive registries are restored to their pre-call
/// state and the first error encountered is returned.
#[allow(clippy::too_many_arguments)]
pub fn prepare_pci(
    mgr: &HostdevManager,
    pci: &dyn PciBackend,
    netdev: &dyn NetdevBackend,
    net_config: &NetConfigStore,
    driver_name: &str,
    domain_name: &str,
    domain_uuid: Option<&str>,
    hostdevs: &mut [HostdevDescriptor],
    flags: PrepareFlags,
) -> Result<(), HostdevError> {
    let mut active = mgr.active_pci().lock();
    let mut inactive = mgr.inactive_pci().lock();

    // Materialize the working list `W` from the PCI SUBSYS entries only.
    // Deduped up front: a duplicate address within one batch is rejected
    // here with a clear error instead of failing opaquely in phase 5.
    let mut w: Vec<PciDevice> = Vec::new();
    for hd in hostdevs.iter() {
        if !hd.is_pci_subsys() {
            continue;
        }
        if vec_contains(&w, &hd.addr) {
            return Err(HostdevError::DuplicateInBatch(hd.addr));
        }
        w.push(PciDevice::new(hd.addr, hd.managed, hd.stub_driver));
    }

    let strict_acs = flags.contains(PrepareFlags::STRICT_ACS_CHECK);

    // Phase 1: assignability + in-use conflict check. No state changed on
    // failure here, so we can return directly.
    for d in &w {
        if !pci.is_assignable(d.addr(), strict_acs) {
            return Err(HostdevError::NotAssignable(d.addr()));
        }
        if let Some(other) = active.iter().find(|o| o.addr() == d.addr()) {
            return Err(match &other.used_by {
                Some(UsedBy { driver_name, domain_name }) => HostdevError::InUse {
                    addr: d.addr(),
                    driver: driver_name.clone(),
                    domain: domain_name.clone(),
                },
                None => HostdevError::InUseUnknownOwner(d.addr()),
            });
        }
    }

    match run_phases_2_through_9(
        pci,
        netdev,
        net_config,
        driver_name,
        domain_name,
        domain_uuid,
        hostdevs,
        &mut w,
        &mut active,
        &mut inactive,
    ) {
        Ok(()) => Ok(()),
        Err((err, point)) => {
            rollback(pci, netdev, net_config, hostdevs, &mut w, point);
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_phases_2_through_9(
    pci: &dyn PciBackend,
    netdev: &dyn NetdevBackend,
    net_config: &NetConfigStore,
    driver_name: &str,
    domain_name: &str,
    domain_uuid: Option<&str>,
    hostdevs: &mut [HostdevDescriptor],
    w: &mut Vec<PciDevice>,
    active: &mut Vec<PciDevice>,
    inactive: &mut Vec<PciDevice>,
) -> Result<(), (HostdevError, FailurePoint)> {
    // Phase 2: detach managed devices, binding them to their chosen stub.
    // Unmanaged devices are assumed already bound by the administrator.
    for d in w.iter_mut().filter(|d| d.managed) {
        pci.detach(d).map_err(|e| (e, FailurePoint::DetachOrReset))?;
    }

    // Phase 3: now that every device is detached, reset is safe even when
    // a reset primitive affects a whole bus.
    let siblings: Vec<PciAddress> = active
        .iter()
        .chain(inactive.iter())
        .map(PciDevice::addr)
        .collect();
    for d in w.iter() {
        pci.reset(d, &siblings).map_err(|e| (e, FailurePoint::DetachOrReset))?;
    }

    // Phase 4: apply SR-IOV VF net config for hostdevs with a Net parent,
    // tracking the highest hostdev index successfully processed.
    let mut last_vf_done: Option<usize> = None;
    for (i, hd) in hostdevs.iter().enumerate() {
        if !hd.is_pci_subsys() {
            continue;
        }
        if let Some(net) = &hd.net_parent {
            net_config
                .prepare(netdev, pci, hd.addr, net, domain_uuid)
                .map_err(|e| (e, FailurePoint::NetConfig { last_vf_done }))?;
        }
        last_vf_done = Some(i);
    }

    // Phase 5: transfer ownership into the active registry. A failure
    // partway through is unwound immediately: already-inserted devices are
    // stolen back so `w` ends up holding every device that needs a
    // best-effort reattach.
    let devices = std::mem::take(w);
    let mut inserted_addrs: Vec<PciAddress> = Vec::new();
    let mut remaining: Vec<PciDevice> = Vec::new();
    let mut insert_err: Option<PciAddress> = None;
    for d in devices {
        if insert_err.is_some() {
            remaining.push(d);
            continue;
        }
        let addr = d.addr();
        match vec_insert(active, d) {
            Ok(()) => inserted_addrs.push(addr),
            Err(d) => {
                insert_err = Some(addr);
                remaining.push(d);
            }
        }
    }
    if let Some(failed_addr) = insert_err {
        for addr in &inserted_addrs {
            if let Some(d) = vec_steal(active, addr) {
                remaining.push(d);
            }
        }
        *w = remaining;
        return Err((HostdevError::RegistryInsertFailed(failed_addr), FailurePoint::Insert));
    }

    // Phase 6: remove the newly-active devices from inactive (no-op if
    // they weren't there, e.g. a device assigned for the first time).
    for addr in &inserted_addrs {
        vec_steal(inactive, addr);
    }

    // Phase 7: attribute ownership to the caller.
    let owner = UsedBy::new(driver_name, domain_name);
    for addr in &inserted_addrs {
        if let Some(dev) = active.iter_mut().find(|d| d.addr() == *addr) {
            dev.used_by = Some(owner.clone());
        }
    }

    // Phase 8: write the detach primitive's recorded orig_states back into
    // the hostdev descriptors so the caller's reverse operation can
    // reconstruct the original binding.
    for hd in hostdevs.iter_mut() {
        if !hd.is_pci_subsys() {
            continue;
        }
        if let Some(dev) = active.iter().find(|d| d.addr() == hd.addr) {
            hd.orig_states = dev.orig_states;
        }
    }

    // Phase 9: `w` is already empty (phase 5 moved every device into
    // `active`); nothing left to steal.
    Ok(())
}

/// Dispatch rollback for a failed prepare. `w` holds every device that must
/// be unwound — either untouched since phase 2/3, or stolen back out of
/// `active` by [`run_phases_2_through_9`] on an insert failure.
fn rollback(
    pci: &dyn PciBackend,
    netdev: &dyn NetdevBackend,
    net_config: &NetConfigStore,
    hostdevs: &[HostdevDescriptor],
    w: &mut Vec<PciDevice>,
    point: FailurePoint,
) {
    if let FailurePoint::NetConfig { last_vf_done } = point {
        if let Some(last) = last_vf_done {
            for hd in hostdevs.iter().take(last + 1) {
                if !hd.is_pci_subsys() {
                    continue;
                }
                if let Some(net) = &hd.net_parent {
                    if let Err(e) = net_config.restore(netdev, pci, hd.addr, net, None) {
                        warn!("failed to restore VF net config for {}: {e}", hd.addr);
                    }
                }
            }
        }
    }

    // Reattach rollback: unbind every remaining device from its stub.
    // This does not rebind the original host driver — errors are logged
    // and suppressed, matching `virHostdevReattachPciDevice`'s best-effort
    // contract.
    for d in w.drain(..) {
        if let Err(e) = pci.reattach(&d) {
            warn!("failed to reattach {} during prepare rollback: {e}", d.addr());
        }
    }
}
