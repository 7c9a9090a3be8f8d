// Copyright (c) 2023 Ant Group
// Copyright (c) 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The PCI device primitive facade.
//!
//! One [`PciDevice`] handle stands for one assignable PCI function. All
//! kernel interaction goes through the sysfs bus directory the handle was
//! created against, so tests can point handles at a scratch tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device_set::{DeviceKey, DeviceSet};
use crate::error::{Error, Result};
use crate::pci::PciAddress;
use crate::types::DeviceOwner;

/// Retry budget for [`PciDevice::wait_for_cleanup`]: 100 polls spaced
/// 100 ms, roughly ten seconds in total.
const CLEANUP_RETRIES: u32 = 100;
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// PCI base class code of bridges. Bridges are never assignable.
const PCI_CLASS_BRIDGE: u32 = 0x06;

/// The stub kernel drivers a device can be parked on while assigned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StubDriver {
    VfioPci,
    PciStub,
}

impl StubDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StubDriver::VfioPci => "vfio-pci",
            StubDriver::PciStub => "pci-stub",
        }
    }

    fn is_stub_name(name: &str) -> bool {
        name == "vfio-pci" || name == "pci-stub"
    }
}

/// Kernel-level state of a slot captured at detach time, so reattach can
/// restore the exact prior condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalState {
    pub unbind_from_stub: bool,
    pub remove_slot: bool,
    pub reprobe: bool,
}

/// Handle on one assignable PCI function.
#[derive(Clone, Debug, PartialEq)]
pub struct PciDevice {
    addr: PciAddress,
    sysfs_root: PathBuf,
    managed: bool,
    stub_driver: StubDriver,
    used_by: Option<DeviceOwner>,
    original: Option<OriginalState>,
}

impl DeviceKey for PciDevice {
    type Key = PciAddress;

    fn key(&self) -> PciAddress {
        self.addr
    }
}

impl PciDevice {
    /// Creates a handle for the device at `addr` under the given sysfs bus
    /// root (normally `/sys/bus/pci`). Fails if the device does not exist.
    pub fn new(sysfs_root: &Path, addr: PciAddress) -> Result<Self> {
        let dev = PciDevice {
            addr,
            sysfs_root: sysfs_root.to_path_buf(),
            managed: false,
            stub_driver: StubDriver::VfioPci,
            used_by: None,
            original: None,
        };
        if let Err(e) = fs::metadata(dev.device_dir()) {
            return Err(Error::OperationFailed(format!(
                "no PCI device found at address {}: {}",
                addr, e
            )));
        }
        Ok(dev)
    }

    pub fn addr(&self) -> PciAddress {
        self.addr
    }

    pub fn managed(&self) -> bool {
        self.managed
    }

    pub fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    pub fn stub_driver(&self) -> StubDriver {
        self.stub_driver
    }

    pub fn set_stub_driver(&mut self, stub: StubDriver) {
        self.stub_driver = stub;
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }

    pub fn set_used_by(&mut self, owner: DeviceOwner) {
        self.used_by = Some(owner);
    }

    pub fn clear_used_by(&mut self) {
        self.used_by = None;
    }

    pub fn original_state(&self) -> Option<OriginalState> {
        self.original
    }

    fn device_dir(&self) -> PathBuf {
        self.sysfs_root.join("devices").join(self.addr.to_string())
    }

    /// Name of the driver currently bound, if any.
    pub fn current_driver(&self) -> Result<Option<String>> {
        match fs::read_link(self.device_dir().join("driver")) {
            Ok(target) => Ok(target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::OperationFailed(format!(
                "cannot resolve driver of {}: {}",
                self.addr, e
            ))),
        }
    }

    /// Host-policy probe: can this function be handed to a guest at all?
    ///
    /// Bridges are never assignable. With `strict_acs` the function must
    /// additionally sit in an IOMMU group, i.e. isolation is enforced by
    /// the platform.
    pub fn is_assignable(&self, strict_acs: bool) -> bool {
        let dir = self.device_dir();
        if !dir.exists() {
            debug!(sl!(), "device vanished"; "device" => %self.addr);
            return false;
        }

        match self.base_class() {
            Ok(class) if class == PCI_CLASS_BRIDGE => {
                debug!(sl!(), "PCI bridges are not assignable"; "device" => %self.addr);
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(sl!(), "cannot read device class"; "device" => %self.addr, "error" => %e);
                return false;
            }
        }

        if strict_acs {
            let group = dir.join("iommu_group");
            if fs::symlink_metadata(&group).is_err() {
                debug!(sl!(), "device is not in an IOMMU group";
                       "device" => %self.addr);
                return false;
            }
        }
        true
    }

    fn base_class(&self) -> Result<u32> {
        let raw = read_sysfs(&self.device_dir().join("class"))?;
        let trimmed = raw.trim().trim_start_matches("0x");
        let class = u32::from_str_radix(trimmed, 16).map_err(|_| {
            Error::OperationFailed(format!("malformed class {:?} for {}", raw.trim(), self.addr))
        })?;
        Ok(class >> 16)
    }

    /// Binds the device to its stub driver, capturing the original state of
    /// the slot so reattach can undo the operation.
    ///
    /// The active registry is consulted so an owned device is never touched.
    pub fn detach(
        &mut self,
        active: &DeviceSet<PciDevice>,
        _inactive: &DeviceSet<PciDevice>,
    ) -> Result<()> {
        if active.contains(&self.addr) {
            return Err(Error::InvalidOperation(format!(
                "not detaching active device {}",
                self.addr
            )));
        }

        let mut orig = OriginalState {
            unbind_from_stub: true,
            remove_slot: false,
            reprobe: false,
        };

        match self.current_driver()?.as_deref() {
            Some(name) if name == self.stub_driver.as_str() => {
                // Already parked on our stub, nothing to unbind.
            }
            Some(name) => {
                if !StubDriver::is_stub_name(name) {
                    orig.reprobe = true;
                }
                self.write_attr(&self.device_dir().join("driver/unbind"), &self.addr.to_string())?;
            }
            None => {}
        }

        self.write_attr(
            &self.device_dir().join("driver_override"),
            self.stub_driver.as_str(),
        )?;
        self.write_attr(&self.sysfs_root.join("drivers_probe"), &self.addr.to_string())?;

        self.original = Some(orig);
        debug!(sl!(), "detached device from host";
               "device" => %self.addr,
               "stub" => self.stub_driver.as_str(),
               "reprobe" => orig.reprobe);
        Ok(())
    }

    /// Returns the device to the host: unbind from the stub and, when the
    /// original state says the host had a driver, trigger a reprobe.
    pub fn reattach(
        &self,
        active: &DeviceSet<PciDevice>,
        _inactive: &DeviceSet<PciDevice>,
    ) -> Result<()> {
        if active.contains(&self.addr) {
            return Err(Error::InvalidOperation(format!(
                "not reattaching active device {}",
                self.addr
            )));
        }

        let orig = self.original.unwrap_or(OriginalState {
            unbind_from_stub: true,
            remove_slot: false,
            reprobe: false,
        });

        if orig.unbind_from_stub {
            if let Some(name) = self.current_driver()? {
                if StubDriver::is_stub_name(&name) {
                    self.write_attr(
                        &self.device_dir().join("driver/unbind"),
                        &self.addr.to_string(),
                    )?;
                }
            }
        }

        self.write_attr(&self.device_dir().join("driver_override"), "\n")?;

        if orig.reprobe {
            self.write_attr(&self.sysfs_root.join("drivers_probe"), &self.addr.to_string())?;
        }
        debug!(sl!(), "reattached device to host";
               "device" => %self.addr, "reprobe" => orig.reprobe);
        Ok(())
    }

    /// Function-level reset through the device's sysfs `reset` attribute.
    ///
    /// Only detached devices may be reset; the caller sequences this after
    /// every sibling sharing the reset scope has been detached.
    pub fn reset(
        &self,
        active: &DeviceSet<PciDevice>,
        _inactive: &DeviceSet<PciDevice>,
    ) -> Result<()> {
        if active.contains(&self.addr) {
            return Err(Error::InvalidOperation(format!(
                "not resetting active device {}",
                self.addr
            )));
        }

        let path = self.device_dir().join("reset");
        match fs::write(&path, "1") {
            Ok(()) => {
                debug!(sl!(), "reset device"; "device" => %self.addr);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::OperationFailed(format!(
                "device {} does not support function-level reset",
                self.addr
            ))),
            Err(e) => Err(Error::OperationFailed(format!(
                "reset of {} failed: {}",
                self.addr, e
            ))),
        }
    }

    /// Polls for a kernel-visible marker under the device directory to
    /// disappear. Returns whether it cleared within the retry budget.
    pub fn wait_for_cleanup(&self, tag: &str) -> bool {
        self.wait_for_cleanup_with(tag, CLEANUP_RETRIES, CLEANUP_RETRY_DELAY)
    }

    fn wait_for_cleanup_with(&self, tag: &str, retries: u32, delay: Duration) -> bool {
        let marker = self.device_dir().join(tag);
        for attempt in 0..retries {
            if fs::symlink_metadata(&marker).is_err() {
                return true;
            }
            if attempt + 1 < retries {
                thread::sleep(delay);
            }
        }
        warn!(sl!(), "kernel did not release device";
              "device" => %self.addr, "marker" => tag);
        false
    }

    fn write_attr(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).map_err(|e| {
            Error::OperationFailed(format!(
                "cannot write {:?} to {}: {}",
                value,
                path.display(),
                e
            ))
        })
    }
}

/// Whether the function at `addr` is an SR-IOV Virtual Function.
pub fn is_virtual_function(sysfs_root: &Path, addr: &PciAddress) -> Result<bool> {
    let physfn = sysfs_root
        .join("devices")
        .join(addr.to_string())
        .join("physfn");
    match fs::symlink_metadata(&physfn) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::OperationFailed(format!(
            "cannot examine {}: {}",
            physfn.display(),
            e
        ))),
    }
}

/// For an SR-IOV VF, the PF's netdev name and the VF's index on the PF.
pub fn vf_info(sysfs_root: &Path, addr: &PciAddress) -> Result<(String, u32)> {
    let dev_dir = sysfs_root.join("devices").join(addr.to_string());
    let pf_target = fs::read_link(dev_dir.join("physfn")).map_err(|e| {
        Error::OperationFailed(format!("device {} has no physical function: {}", addr, e))
    })?;
    let pf_name = pf_target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            Error::OperationFailed(format!("malformed physfn link for {}", addr))
        })?;
    let pf_dir = sysfs_root.join("devices").join(&pf_name);

    let vf_index = vf_index_on_pf(&pf_dir, addr)?.ok_or_else(|| {
        Error::OperationFailed(format!(
            "device {} not listed among the VFs of {}",
            addr, pf_name
        ))
    })?;

    let netdev = first_netdev(&pf_dir)?.ok_or_else(|| {
        Error::OperationFailed(format!("physical function {} has no netdev", pf_name))
    })?;

    Ok((netdev, vf_index))
}

fn vf_index_on_pf(pf_dir: &Path, addr: &PciAddress) -> Result<Option<u32>> {
    let wanted = addr.to_string();
    let entries = fs::read_dir(pf_dir).map_err(|e| {
        Error::OperationFailed(format!("cannot read {}: {}", pf_dir.display(), e))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| {
            Error::OperationFailed(format!("cannot read {}: {}", pf_dir.display(), e))
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let index = match name.strip_prefix("virtfn").and_then(|n| n.parse::<u32>().ok()) {
            Some(index) => index,
            None => continue,
        };
        if let Ok(target) = fs::read_link(entry.path()) {
            if target.file_name() == Some(std::ffi::OsStr::new(&wanted)) {
                return Ok(Some(index));
            }
        }
    }
    Ok(None)
}

fn first_netdev(pf_dir: &Path) -> Result<Option<String>> {
    let net_dir = pf_dir.join("net");
    let entries = match fs::read_dir(&net_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::OperationFailed(format!(
                "cannot read {}: {}",
                net_dir.display(),
                e
            )))
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

fn read_sysfs(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::OperationFailed(format!("cannot read {}: {}", path.display(), e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    /// A scratch sysfs bus tree mirroring the layout of /sys/bus/pci.
    pub(crate) struct FakeSysfs {
        root: TempDir,
    }

    impl FakeSysfs {
        pub(crate) fn new() -> Self {
            let root = TempDir::new().unwrap();
            fs::create_dir(root.path().join("devices")).unwrap();
            fs::create_dir(root.path().join("drivers")).unwrap();
            fs::write(root.path().join("drivers_probe"), "").unwrap();
            FakeSysfs { root }
        }

        pub(crate) fn path(&self) -> &Path {
            self.root.path()
        }

        pub(crate) fn add_device(&self, addr: &str) -> PathBuf {
            let dir = self.root.path().join("devices").join(addr);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("class"), "0x020000\n").unwrap();
            fs::write(dir.join("driver_override"), "").unwrap();
            fs::write(dir.join("reset"), "").unwrap();
            dir
        }

        pub(crate) fn add_driver(&self, name: &str) {
            let dir = self.root.path().join("drivers").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("bind"), "").unwrap();
            fs::write(dir.join("unbind"), "").unwrap();
        }

        pub(crate) fn bind(&self, addr: &str, driver: &str) {
            let link = self.root.path().join("devices").join(addr).join("driver");
            if link.exists() || fs::symlink_metadata(&link).is_ok() {
                fs::remove_file(&link).unwrap();
            }
            symlink(format!("../../drivers/{}", driver), link).unwrap();
        }

        pub(crate) fn set_iommu_group(&self, addr: &str, group: u32) {
            let link = self
                .root
                .path()
                .join("devices")
                .join(addr)
                .join("iommu_group");
            symlink(format!("../../../kernel/iommu_groups/{}", group), link).unwrap();
        }

        pub(crate) fn make_vf(&self, vf: &str, pf: &str, index: u32, pf_netdev: &str) {
            let devices = self.root.path().join("devices");
            symlink(format!("../{}", pf), devices.join(vf).join("physfn")).unwrap();
            symlink(
                format!("../{}", vf),
                devices.join(pf).join(format!("virtfn{}", index)),
            )
            .unwrap();
            fs::create_dir_all(devices.join(pf).join("net").join(pf_netdev)).unwrap();
        }

        pub(crate) fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.root.path().join(rel)).unwrap()
        }
    }

    pub(crate) fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_new_requires_device_presence() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");

        assert!(PciDevice::new(sysfs.path(), addr("0000:03:00.0")).is_ok());
        let err = PciDevice::new(sysfs.path(), addr("0000:04:00.0")).unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[test]
    fn test_detach_from_host_driver() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");
        sysfs.add_driver("igb");
        sysfs.bind("0000:03:00.0", "igb");

        let mut dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        dev.set_managed(true);
        let active = DeviceSet::new();
        let inactive = DeviceSet::new();
        dev.detach(&active, &inactive).unwrap();

        let orig = dev.original_state().unwrap();
        assert!(orig.unbind_from_stub);
        assert!(orig.reprobe);
        assert!(!orig.remove_slot);
        assert_eq!(sysfs.read("drivers/igb/unbind"), "0000:03:00.0");
        assert_eq!(
            sysfs.read("devices/0000:03:00.0/driver_override"),
            "vfio-pci"
        );
        assert_eq!(sysfs.read("drivers_probe"), "0000:03:00.0");
    }

    #[test]
    fn test_detach_of_unbound_device_skips_reprobe() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");

        let mut dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        dev.detach(&DeviceSet::new(), &DeviceSet::new()).unwrap();
        let orig = dev.original_state().unwrap();
        assert!(orig.unbind_from_stub);
        assert!(!orig.reprobe);
    }

    #[test]
    fn test_detach_refuses_active_device() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");

        let mut dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        let mut active = DeviceSet::new();
        active.add(dev.clone()).unwrap();

        let err = dev.detach(&active, &DeviceSet::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert!(dev.original_state().is_none());
    }

    #[test]
    fn test_reset_writes_attribute() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");
        sysfs.add_driver("vfio-pci");
        sysfs.bind("0000:03:00.0", "vfio-pci");

        let dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        dev.reset(&DeviceSet::new(), &DeviceSet::new()).unwrap();
        assert_eq!(sysfs.read("devices/0000:03:00.0/reset"), "1");
    }

    #[test]
    fn test_reset_refuses_active_device() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");

        let dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        let mut active = DeviceSet::new();
        active.add(dev.clone()).unwrap();

        let err = dev.reset(&active, &DeviceSet::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(sysfs.read("devices/0000:03:00.0/reset"), "");
    }

    #[test]
    fn test_reset_without_support_fails() {
        let sysfs = FakeSysfs::new();
        let dir = sysfs.add_device("0000:03:00.0");
        fs::remove_file(dir.join("reset")).unwrap();

        let dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        let err = dev.reset(&DeviceSet::new(), &DeviceSet::new()).unwrap_err();
        assert!(matches!(err, Error::OperationFailed(_)));
    }

    #[test]
    fn test_reattach_restores_host_binding() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");
        sysfs.add_driver("igb");
        sysfs.add_driver("vfio-pci");
        sysfs.bind("0000:03:00.0", "igb");

        let mut dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();
        dev.detach(&DeviceSet::new(), &DeviceSet::new()).unwrap();

        // The kernel would have moved the binding; emulate it.
        sysfs.bind("0000:03:00.0", "vfio-pci");
        fs::write(sysfs.path().join("drivers_probe"), "").unwrap();

        dev.reattach(&DeviceSet::new(), &DeviceSet::new()).unwrap();
        assert_eq!(sysfs.read("drivers/vfio-pci/unbind"), "0000:03:00.0");
        assert_eq!(sysfs.read("devices/0000:03:00.0/driver_override"), "\n");
        assert_eq!(sysfs.read("drivers_probe"), "0000:03:00.0");
    }

    #[test]
    fn test_wait_for_cleanup() {
        let sysfs = FakeSysfs::new();
        let dir = sysfs.add_device("0000:03:00.0");
        let dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();

        assert!(dev.wait_for_cleanup_with("kvm_assigned_device", 3, Duration::from_millis(1)));

        fs::write(dir.join("kvm_assigned_device"), "").unwrap();
        assert!(!dev.wait_for_cleanup_with("kvm_assigned_device", 3, Duration::from_millis(1)));
    }

    #[test]
    fn test_is_assignable() {
        let sysfs = FakeSysfs::new();
        let dir = sysfs.add_device("0000:03:00.0");
        let dev = PciDevice::new(sysfs.path(), addr("0000:03:00.0")).unwrap();

        assert!(dev.is_assignable(false));
        // No IOMMU group yet, so the strict probe refuses it.
        assert!(!dev.is_assignable(true));
        sysfs.set_iommu_group("0000:03:00.0", 12);
        assert!(dev.is_assignable(true));

        fs::write(dir.join("class"), "0x060400\n").unwrap();
        assert!(!dev.is_assignable(false));
    }

    #[test]
    fn test_vf_introspection() {
        let sysfs = FakeSysfs::new();
        sysfs.add_device("0000:03:00.0");
        sysfs.add_device("0000:03:10.2");
        sysfs.make_vf("0000:03:10.2", "0000:03:00.0", 2, "enp3s0");

        assert!(is_virtual_function(sysfs.path(), &addr("0000:03:10.2")).unwrap());
        assert!(!is_virtual_function(sysfs.path(), &addr("0000:03:00.0")).unwrap());

        let (netdev, index) = vf_info(sysfs.path(), &addr("0000:03:10.2")).unwrap();
        assert_eq!(netdev, "enp3s0");
        assert_eq!(index, 2);

        assert!(vf_info(sysfs.path(), &addr("0000:03:00.0")).is_err());
    }
}
