//! The process-wide singleton, binding the four registries and the state
//! directory.
//!
//! Global kernel state (IRQ tables, scheduler runtime) is typically
//! initialized through a one-shot `InitFlag`/`OnceLock`; this follows the
//! same pattern via `std::sync::OnceLock` since there's no boot-time
//! ordering to respect here.

use std::path::Path;
use std::sync::OnceLock;

use hostdev_types::{HostdevError, PciDevice};
use log::info;

use crate::config::ManagerConfig;
use crate::registry::{DeviceRegistry, ScsiDevice, UsbDevice};

/// Binds the four device registries, the state directory, and lazy
/// one-time initialization.
///
/// This type serves both as the process-wide singleton and as an explicit
/// context value a caller can construct directly: `get_default()` reaches
/// the process-wide instance, while [`HostdevManager::with_config`] builds
/// a standalone instance for tests.
pub struct HostdevManager {
    active_pci: DeviceRegistry<PciDevice>,
    inactive_pci: DeviceRegistry<PciDevice>,
    active_usb: DeviceRegistry<UsbDevice>,
    active_scsi: DeviceRegistry<ScsiDevice>,
    config: ManagerConfig,
}

static DEFAULT: OnceLock<HostdevManager> = OnceLock::new();

impl HostdevManager {
    /// Construct a standalone manager: four empty registries plus an
    /// ensured state directory. Failure to create the state directory is
    /// fatal for initialization.
    pub fn with_config(config: ManagerConfig) -> Result<Self, HostdevError> {
        std::fs::create_dir_all(&config.state_dir)
            .map_err(|e| HostdevError::StateDirCreate(config.state_dir.display().to_string(), e))?;
        info!("hostdev manager state dir: {}", config.state_dir.display());
        Ok(Self {
            active_pci: DeviceRegistry::new(),
            inactive_pci: DeviceRegistry::new(),
            active_usb: DeviceRegistry::new(),
            active_scsi: DeviceRegistry::new(),
            config,
        })
    }

    /// The process-wide singleton, initialized lazily and exactly once;
    /// there is no destruction path. Initialization failure is fatal,
    /// matching `virHostdevManagerOnceInit`'s contract that a state-dir
    /// failure aborts the whole process the first time any caller touches
    /// the manager.
    pub fn get_default() -> &'static HostdevManager {
        DEFAULT.get_or_init(|| {
            HostdevManager::with_config(ManagerConfig::default())
                .expect("hostdev manager failed to initialize")
        })
    }

    pub fn active_pci(&self) -> &DeviceRegistry<PciDevice> {
        &self.active_pci
    }

    pub fn inactive_pci(&self) -> &DeviceRegistry<PciDevice> {
        &self.inactive_pci
    }

    pub fn active_usb(&self) -> &DeviceRegistry<UsbDevice> {
        &self.active_usb
    }

    pub fn active_scsi(&self) -> &DeviceRegistry<ScsiDevice> {
        &self.active_scsi
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }
}
