//! Pipeline-level scenario tests, run against fake
//! [`PciBackend`]/[`NetdevBackend`] implementations the same way a driver
//! registry is often exercised through function pointers rather than a
//! concrete device.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hostdev_pci::{NetConfigStore, NetdevBackend, PciBackend};
use hostdev_types::{
    HostdevDescriptor, HostdevError, HostdevMode, NetParent, PciAddress, StubDriver, SubsysType,
    VirtPortProfile, VirtPortType,
};

use crate::{prepare_pci, release_pci, HostdevManager, ManagerConfig, PrepareFlags};

#[derive(Default)]
struct FakePciBackend {
    not_assignable: HashSet<PciAddress>,
    reset_fail: HashSet<PciAddress>,
    vf_info: HashMap<PciAddress, (String, u32)>,
    reattached: Mutex<Vec<PciAddress>>,
}

impl PciBackend for FakePciBackend {
    fn is_assignable(&self, addr: PciAddress, _strict_acs: bool) -> bool {
        !self.not_assignable.contains(&addr)
    }

    fn detach(&self, dev: &mut hostdev_types::PciDevice) -> Result<(), HostdevError> {
        dev.orig_states.unbind_from_stub = true;
        dev.orig_states.reprobe = true;
        Ok(())
    }

    fn reset(&self, dev: &hostdev_types::PciDevice, _siblings: &[PciAddress]) -> Result<(), HostdevError> {
        if self.reset_fail.contains(&dev.addr()) {
            return Err(HostdevError::ResetFailed(
                dev.addr(),
                std::io::Error::other("fake reset failure"),
            ));
        }
        Ok(())
    }

    fn reattach(&self, dev: &hostdev_types::PciDevice) -> Result<(), HostdevError> {
        self.reattached.lock().unwrap().push(dev.addr());
        Ok(())
    }

    fn wait_for_cleanup(&self, _dev: &hostdev_types::PciDevice, _attr: &str) -> bool {
        false
    }

    fn sysfs_path(&self, _addr: PciAddress) -> PathBuf {
        PathBuf::new()
    }

    fn is_virtual_function(&self, addr: PciAddress) -> Result<bool, HostdevError> {
        Ok(self.vf_info.contains_key(&addr))
    }

    fn get_vf_info(&self, addr: PciAddress) -> Result<(String, u32), HostdevError> {
        self.vf_info.get(&addr).cloned().ok_or(HostdevError::NotAVirtualFunction)
    }

    fn get_netname(&self, _addr: PciAddress) -> Result<String, HostdevError> {
        Ok("eth0".into())
    }
}

#[derive(Default)]
struct FakeNetdevBackend {
    replace_fail: HashSet<(String, Option<u32>)>,
    restored: Mutex<Vec<(String, Option<u32>)>>,
    virtport_state: Mutex<HashMap<(String, Option<u32>), bool>>,
}

impl NetdevBackend for FakeNetdevBackend {
    fn replace_config(
        &self,
        pf: &str,
        vf: Option<u32>,
        _mac: [u8; 6],
        _vlan: Option<u16>,
        _state_dir: &Path,
    ) -> Result<(), HostdevError> {
        if self.replace_fail.contains(&(pf.to_string(), vf)) {
            return Err(HostdevError::NetConfigIo {
                pf: pf.to_string(),
                vf,
                source: std::io::Error::other("fake replace failure"),
            });
        }
        Ok(())
    }

    fn restore_config(&self, pf: &str, vf: Option<u32>, _state_dir: &Path) -> Result<(), HostdevError> {
        self.restored.lock().unwrap().push((pf.to_string(), vf));
        Ok(())
    }

    fn virtport_associate(
        &self,
        linkdev: &str,
        vf: Option<u32>,
        _profile: &VirtPortProfile,
        _mac: [u8; 6],
        _domain_uuid: Option<&str>,
    ) -> Result<(), HostdevError> {
        self.virtport_state.lock().unwrap().insert((linkdev.to_string(), vf), true);
        Ok(())
    }

    fn virtport_disassociate(
        &self,
        linkdev: &str,
        vf: Option<u32>,
        _profile: &VirtPortProfile,
        _mac: [u8; 6],
    ) -> Result<(), HostdevError> {
        self.virtport_state.lock().unwrap().insert((linkdev.to_string(), vf), false);
        Ok(())
    }
}

fn addr(bus: u8) -> PciAddress {
    PciAddress::new(0, bus, 0, 0).unwrap()
}

fn pci_hostdev(addr: PciAddress, managed: bool) -> HostdevDescriptor {
    HostdevDescriptor {
        mode: HostdevMode::Subsys,
        subsys_type: SubsysType::Pci,
        addr,
        managed,
        stub_driver: StubDriver::VfioPci,
        net_parent: None,
        orig_states: Default::default(),
    }
}

fn test_manager() -> (HostdevManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mgr = HostdevManager::with_config(ManagerConfig {
        state_dir: dir.path().to_path_buf(),
        ..ManagerConfig::default()
    })
    .unwrap();
    (mgr, dir)
}

/// Scenario 1: single managed VFIO device, clean prepare/release.
#[test]
fn scenario_1_managed_vfio_clean_round_trip() {
    let (mgr, dir) = test_manager();
    let pci = FakePciBackend::default();
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hostdevs = vec![pci_hostdev(addr(3), true)];

    prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap();

    assert!(mgr.active_pci().contains(&addr(3)));
    let active = mgr.active_pci().find(&addr(3)).unwrap();
    assert_eq!(active.used_by.unwrap().driver_name, "qemu");
    assert!(hostdevs[0].orig_states.unbind_from_stub);

    release_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", &hostdevs, None);

    assert!(!mgr.active_pci().contains(&addr(3)));
    assert!(!mgr.inactive_pci().contains(&addr(3)));
}

/// Scenario 2: unmanaged device ends up in the inactive registry after
/// release instead of vanishing.
#[test]
fn scenario_2_unmanaged_device_goes_inactive_on_release() {
    let (mgr, dir) = test_manager();
    let pci = FakePciBackend::default();
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hostdevs = vec![pci_hostdev(addr(4), false)];

    prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap();
    assert!(mgr.active_pci().contains(&addr(4)));

    release_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", &hostdevs, None);

    assert!(!mgr.active_pci().contains(&addr(4)));
    assert!(mgr.inactive_pci().contains(&addr(4)));
}

/// Scenario 3: a second prepare of the same address from a different
/// domain fails with the first domain's attribution.
#[test]
fn scenario_3_conflicting_prepare_reports_current_owner() {
    let (mgr, dir) = test_manager();
    let pci = FakePciBackend::default();
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut first = vec![pci_hostdev(addr(5), true)];
    prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut first, PrepareFlags::empty())
        .unwrap();

    let mut second = vec![pci_hostdev(addr(5), true)];
    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm2", None, &mut second, PrepareFlags::empty())
        .unwrap_err();

    match err {
        HostdevError::InUse { driver, domain, .. } => {
            assert_eq!(driver, "qemu");
            assert_eq!(domain, "vm1");
        }
        other => panic!("expected InUse, got {other:?}"),
    }
}

/// Scenario 4: a VF hostdev with an 8021Qbh virtualport associates on
/// prepare and disassociates on release.
#[test]
fn scenario_4_virtualport_qbh_associates_and_disassociates() {
    let (mgr, dir) = test_manager();
    let mut pci = FakePciBackend::default();
    pci.vf_info.insert(addr(6), ("eth0".into(), 2));
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hd = pci_hostdev(addr(6), true);
    hd.net_parent = Some(NetParent {
        mac: [0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc],
        vlan: None,
        virt_port: Some(VirtPortProfile {
            virt_port_type: VirtPortType::Qbh8021,
        }),
    });
    let mut hostdevs = vec![hd];

    prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", Some("uuid-1"), &mut hostdevs, PrepareFlags::empty())
        .unwrap();
    assert_eq!(
        netdev.virtport_state.lock().unwrap().get(&("eth0".to_string(), Some(2))),
        Some(&true)
    );

    release_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", &hostdevs, None);
    assert_eq!(
        netdev.virtport_state.lock().unwrap().get(&("eth0".to_string(), Some(2))),
        Some(&false)
    );
    assert!(!mgr.active_pci().contains(&addr(6)));
}

/// Scenario 5: an unsupported virtualport type is rejected and leaves the
/// registries untouched.
#[test]
fn scenario_5_unsupported_virtualport_rejected() {
    let (mgr, dir) = test_manager();
    let mut pci = FakePciBackend::default();
    pci.vf_info.insert(addr(7), ("eth0".into(), 1));
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hd = pci_hostdev(addr(7), true);
    hd.net_parent = Some(NetParent {
        mac: [0; 6],
        vlan: None,
        virt_port: Some(VirtPortProfile {
            virt_port_type: VirtPortType::OpenVSwitch,
        }),
    });
    let mut hostdevs = vec![hd];

    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap_err();
    assert!(matches!(err, HostdevError::VirtPortTypeUnsupported(_)));
    assert!(!mgr.active_pci().contains(&addr(7)));
    assert!(!mgr.inactive_pci().contains(&addr(7)));
}

/// Scenario 6: two VF hostdevs, the second's reset fails. The first VF's
/// net config must be restored from its save file and neither address
/// ends up in the active registry.
#[test]
fn scenario_6_partial_failure_restores_first_vf_net_config() {
    let (mgr, dir) = test_manager();
    let mut pci = FakePciBackend::default();
    pci.vf_info.insert(addr(8), ("eth0".into(), 0));
    pci.vf_info.insert(addr(9), ("eth0".into(), 1));
    pci.reset_fail.insert(addr(9));
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hd0 = pci_hostdev(addr(8), true);
    hd0.net_parent = Some(NetParent {
        mac: [1, 2, 3, 4, 5, 6],
        vlan: None,
        virt_port: None,
    });
    let mut hd1 = pci_hostdev(addr(9), true);
    hd1.net_parent = Some(NetParent {
        mac: [6, 5, 4, 3, 2, 1],
        vlan: None,
        virt_port: None,
    });
    let mut hostdevs = vec![hd0, hd1];

    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap_err();
    assert!(matches!(err, HostdevError::ResetFailed(a, _) if a == addr(9)));

    assert!(!mgr.active_pci().contains(&addr(8)));
    assert!(!mgr.active_pci().contains(&addr(9)));
    // Reset fails in phase 3, before phase 4 (VF net config) even runs, so
    // nothing was saved to restore — what matters is that the registries
    // are left untouched and both stub bindings are unwound.
    assert!(pci.reattached.lock().unwrap().contains(&addr(8)));
    assert!(pci.reattached.lock().unwrap().contains(&addr(9)));
}

/// A genuine phase-4 partial failure: VF 0 applies its net config
/// successfully, VF 1's `replace_config` fails. VF 0's config must be
/// restored and neither device reaches the active registry.
#[test]
fn phase_4_failure_restores_earlier_vf_net_config() {
    let (mgr, dir) = test_manager();
    let mut pci = FakePciBackend::default();
    pci.vf_info.insert(addr(10), ("eth0".into(), 0));
    pci.vf_info.insert(addr(11), ("eth0".into(), 1));
    let mut netdev = FakeNetdevBackend::default();
    netdev.replace_fail.insert(("eth0".to_string(), Some(1)));
    let net_config = NetConfigStore::new(dir.path());

    let mut hd0 = pci_hostdev(addr(10), true);
    hd0.net_parent = Some(NetParent { mac: [1; 6], vlan: None, virt_port: None });
    let mut hd1 = pci_hostdev(addr(11), true);
    hd1.net_parent = Some(NetParent { mac: [2; 6], vlan: None, virt_port: None });
    let mut hostdevs = vec![hd0, hd1];

    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap_err();
    assert!(matches!(err, HostdevError::NetConfigIo { .. }));

    // VF 0's config was saved during phase 4 and must be restored during
    // rollback (`i <= last_vf_done`, inclusive of the last hostdev that
    // succeeded).
    assert!(netdev.restored.lock().unwrap().contains(&("eth0".to_string(), Some(0))));
    assert!(!mgr.active_pci().contains(&addr(10)));
    assert!(!mgr.active_pci().contains(&addr(11)));
}

/// Duplicate addresses in one batch are rejected up front rather than
/// failing opaquely in phase 5.
#[test]
fn duplicate_in_batch_is_rejected_up_front() {
    let (mgr, dir) = test_manager();
    let pci = FakePciBackend::default();
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hostdevs = vec![pci_hostdev(addr(12), true), pci_hostdev(addr(12), true)];
    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap_err();
    assert!(matches!(err, HostdevError::DuplicateInBatch(a) if a == addr(12)));
    assert!(mgr.active_pci().is_empty());
}

/// Release of a device owned by a different domain leaves it untouched.
#[test]
fn release_skips_device_owned_by_other_domain() {
    let (mgr, dir) = test_manager();
    let pci = FakePciBackend::default();
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hostdevs = vec![pci_hostdev(addr(13), true)];
    prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap();

    // A different domain asks to release the same address; it must be a
    // silent no-op.
    release_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm2", &hostdevs, None);
    assert!(mgr.active_pci().contains(&addr(13)));
    assert_eq!(mgr.active_pci().find(&addr(13)).unwrap().used_by.unwrap().domain_name, "vm1");
}

/// Not-assignable devices fail phase 1 without touching any registry.
#[test]
fn not_assignable_device_rejected_in_phase_one() {
    let (mgr, dir) = test_manager();
    let mut pci = FakePciBackend::default();
    pci.not_assignable.insert(addr(14));
    let netdev = FakeNetdevBackend::default();
    let net_config = NetConfigStore::new(dir.path());

    let mut hostdevs = vec![pci_hostdev(addr(14), true)];
    let err = prepare_pci(&mgr, &pci, &netdev, &net_config, "qemu", "vm1", None, &mut hostdevs, PrepareFlags::empty())
        .unwrap_err();
    assert!(matches!(err, HostdevError::NotAssignable(a) if a == addr(14)));
    assert!(mgr.active_pci().is_empty());
}

/// Concurrency invariant check: interleaved prepare/release across many
/// threads never leaves an address in both registries, nor leaves an
/// active entry without attribution.
#[test]
fn concurrent_prepare_release_preserves_invariants() {
    use std::sync::Arc;
    use std::thread;

    let (mgr, dir) = test_manager();
    let mgr = Arc::new(mgr);
    let pci = Arc::new(FakePciBackend::default());
    let netdev = Arc::new(FakeNetdevBackend::default());
    let net_config = Arc::new(NetConfigStore::new(dir.path()));

    let mut handles = Vec::new();
    for t in 0..8u8 {
        let mgr = Arc::clone(&mgr);
        let pci = Arc::clone(&pci);
        let netdev = Arc::clone(&netdev);
        let net_config = Arc::clone(&net_config);
        handles.push(thread::spawn(move || {
            let a = addr(100 + (t % 4));
            let domain = format!("vm{t}");
            for _ in 0..20 {
                let mut hostdevs = vec![pci_hostdev(a, true)];
                if prepare_pci(&mgr, pci.as_ref(), netdev.as_ref(), &net_config, "qemu", &domain, None, &mut hostdevs, PrepareFlags::empty())
                    .is_ok()
                {
                    release_pci(&mgr, pci.as_ref(), netdev.as_ref(), &net_config, "qemu", &domain, &hostdevs, None);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Active and inactive registries are disjoint.
    for k in mgr.active_pci().keys() {
        assert!(!mgr.inactive_pci().contains(&k));
    }
    // Every active entry has attribution.
    for k in mgr.active_pci().keys() {
        assert!(mgr.active_pci().find(&k).unwrap().used_by.is_some());
    }
}
