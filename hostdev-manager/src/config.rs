//! Construction-time manager configuration.
//!
//! A plain struct with a `Default` impl, rather than a fixed-constant /
//! board-config-struct approach, since every knob here is something a
//! caller legitimately wants to override for tests or an alternate root.

use std::path::PathBuf;
use std::time::Duration;

/// Resolved at initialization time; the default mirrors libvirt's
/// `HOSTDEV_STATE_DIR` under a generic `<localstate>/run` root.
const DEFAULT_STATE_DIR: &str = "/var/run/hostdevmgr";

/// The reattach-cleanup poll is bounded at 100 x 100ms by default, matching
/// `virHostdevReattachPciDevice`'s hardcoded retry loop; exposed here so
/// tests don't have to pay the full 10 seconds.
const DEFAULT_REATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_REATTACH_POLL_RETRIES: u32 = 100;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub state_dir: PathBuf,
    pub reattach_poll_interval: Duration,
    pub reattach_poll_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            reattach_poll_interval: DEFAULT_REATTACH_POLL_INTERVAL,
            reattach_poll_retries: DEFAULT_REATTACH_POLL_RETRIES,
        }
    }
}
