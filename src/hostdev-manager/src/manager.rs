// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! The process-wide host device manager.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use nix::sys::stat::Mode;
use nix::unistd::mkdir;

use crate::device::PciDevice;
use crate::device_set::DeviceSet;
use crate::error::{Error, Result};
use crate::netvf::{IpLinkVfBackend, VfNetBackend};
use crate::scsi::ScsiDevice;
use crate::usb::UsbDevice;

/// Where per-VF network configuration is saved across an assignment.
pub const DEFAULT_STATE_DIR: &str = "/run/hostdev-manager";

/// The kernel's PCI bus directory.
pub const DEFAULT_PCI_SYSFS: &str = "/sys/bus/pci";

/// Holds the device registries and the state directory.
///
/// One manager exists per process (see [`default_manager`]); tests build
/// their own against scratch directories. The PCI pipelines lock the
/// active registry before the inactive one and hold both for the whole
/// operation; nothing else may take these locks in the reverse order.
pub struct HostdevManager {
    state_dir: PathBuf,
    pci_sysfs: PathBuf,
    net_backend: Box<dyn VfNetBackend>,
    pub(crate) active_pci: Mutex<DeviceSet<PciDevice>>,
    pub(crate) inactive_pci: Mutex<DeviceSet<PciDevice>>,
    pub(crate) active_usb: Mutex<DeviceSet<UsbDevice>>,
    pub(crate) active_scsi: Mutex<DeviceSet<ScsiDevice>>,
}

impl HostdevManager {
    /// Creates a manager with explicit paths and net backend. The state
    /// directory is created (mode 0755, recursively) if missing.
    pub fn new(
        state_dir: &Path,
        pci_sysfs: &Path,
        net_backend: Box<dyn VfNetBackend>,
    ) -> Result<Self> {
        make_path_0755(state_dir)?;
        Ok(HostdevManager {
            state_dir: state_dir.to_path_buf(),
            pci_sysfs: pci_sysfs.to_path_buf(),
            net_backend,
            active_pci: Mutex::new(DeviceSet::new()),
            inactive_pci: Mutex::new(DeviceSet::new()),
            active_usb: Mutex::new(DeviceSet::new()),
            active_scsi: Mutex::new(DeviceSet::new()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn pci_sysfs(&self) -> &Path {
        &self.pci_sysfs
    }

    pub fn net_backend(&self) -> &dyn VfNetBackend {
        self.net_backend.as_ref()
    }

    /// Registry invariants of the manager, asserted by pipeline tests
    /// after every public operation.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let active = self.active_pci.lock().unwrap();
        let inactive = self.inactive_pci.lock().unwrap();
        for dev in active.iter() {
            assert!(
                dev.used_by().is_some(),
                "active device {} has no owner",
                dev.addr()
            );
            assert!(
                !inactive.contains(&dev.addr()),
                "device {} is in both registries",
                dev.addr()
            );
            if dev.managed() {
                assert!(
                    dev.original_state().is_some(),
                    "managed active device {} has no original state",
                    dev.addr()
                );
            }
        }
    }
}

lazy_static! {
    static ref DEFAULT_MANAGER: Mutex<Option<Arc<HostdevManager>>> = Mutex::new(None);
}

/// The shared per-process manager, wired to the real host paths. The
/// first call performs the one-time initialization.
pub fn default_manager() -> Result<Arc<HostdevManager>> {
    let mut guard = DEFAULT_MANAGER.lock().unwrap();
    if let Some(mgr) = guard.as_ref() {
        return Ok(mgr.clone());
    }
    let mgr = Arc::new(HostdevManager::new(
        Path::new(DEFAULT_STATE_DIR),
        Path::new(DEFAULT_PCI_SYSFS),
        Box::new(IpLinkVfBackend),
    )?);
    *guard = Some(mgr.clone());
    Ok(mgr)
}

fn make_path_0755(path: &Path) -> Result<()> {
    let mode = Mode::from_bits_truncate(0o755);
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        match mkdir(&current, mode) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => {
                return Err(Error::OperationFailed(format!(
                    "cannot create state directory {}: {}",
                    current.display(),
                    e
                )))
            }
        }
    }
    Ok(())
}
