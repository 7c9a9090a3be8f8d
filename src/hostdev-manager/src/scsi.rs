// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! SCSI hostdev tracking, mirroring the USB registry pattern.

use slog::Logger;

use crate::device_set::DeviceKey;
use crate::error::{Error, Result};
use crate::manager::HostdevManager;
use crate::types::{DeviceOwner, HostdevDef, ScsiHostdev};

/// Handle on one assigned SCSI device, identified by adapter, bus, target
/// and unit.
#[derive(Clone, Debug)]
pub struct ScsiDevice {
    host: u32,
    bus: u32,
    target: u32,
    lun: u64,
    used_by: Option<DeviceOwner>,
}

impl DeviceKey for ScsiDevice {
    type Key = (u32, u32, u32, u64);

    fn key(&self) -> (u32, u32, u32, u64) {
        (self.host, self.bus, self.target, self.lun)
    }
}

impl ScsiDevice {
    pub fn new(host: u32, bus: u32, target: u32, lun: u64) -> Self {
        ScsiDevice {
            host,
            bus,
            target,
            lun,
            used_by: None,
        }
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }

    fn name(&self) -> String {
        format!("{}:{}:{}:{}", self.host, self.bus, self.target, self.lun)
    }
}

fn scsi_name(scsi: &ScsiHostdev) -> String {
    format!("{}:{}:{}:{}", scsi.host, scsi.bus, scsi.target, scsi.lun)
}

/// Claims every SCSI hostdev in the list for the given guest, or none.
pub fn prepare_scsi(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    hostdevs: &[HostdevDef],
) -> Result<()> {
    let mut active = mgr.active_scsi.lock().unwrap();

    for hostdev in hostdevs {
        let scsi = match hostdev {
            HostdevDef::Scsi(scsi) => scsi,
            _ => continue,
        };
        let key = (scsi.host, scsi.bus, scsi.target, scsi.lun);
        if let Some(existing) = active.get(&key) {
            let msg = match existing.used_by() {
                Some(owner) => format!(
                    "SCSI device {} is in use by driver {}, domain {}",
                    existing.name(),
                    owner.drv_name,
                    owner.dom_name
                ),
                None => format!("SCSI device {} is already in use", existing.name()),
            };
            return Err(Error::InvalidOperation(msg));
        }
    }

    let mut added: Vec<(u32, u32, u32, u64)> = Vec::new();
    for hostdev in hostdevs {
        let scsi = match hostdev {
            HostdevDef::Scsi(scsi) => scsi,
            _ => continue,
        };
        let mut dev = ScsiDevice::new(scsi.host, scsi.bus, scsi.target, scsi.lun);
        dev.used_by = Some(DeviceOwner::new(drv_name, dom_name));
        let key = dev.key();
        if active.add(dev).is_err() {
            for added_key in &added {
                active.steal(added_key);
            }
            return Err(Error::InvalidOperation(format!(
                "SCSI device {} listed more than once",
                scsi_name(scsi)
            )));
        }
        added.push(key);
    }

    if !added.is_empty() {
        debug!(logger, "prepared SCSI devices";
               "domain" => dom_name, "count" => added.len());
    }
    Ok(())
}

/// Releases the listed SCSI devices owned by the given guest.
pub fn reattach_scsi(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    hostdevs: &[HostdevDef],
) {
    let mut active = mgr.active_scsi.lock().unwrap();

    for hostdev in hostdevs {
        let scsi = match hostdev {
            HostdevDef::Scsi(scsi) => scsi,
            _ => continue,
        };
        let key = (scsi.host, scsi.bus, scsi.target, scsi.lun);
        match active.get(&key) {
            None => {
                debug!(logger, "SCSI device not active, nothing to release";
                       "device" => scsi_name(scsi));
            }
            Some(dev) => {
                let owned = dev
                    .used_by()
                    .map(|o| o.drv_name == drv_name && o.dom_name == dom_name)
                    .unwrap_or(false);
                if owned {
                    active.steal(&key);
                } else {
                    warn!(logger, "not releasing SCSI device owned by another domain";
                          "device" => scsi_name(scsi));
                }
            }
        }
    }
}
