// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! USB hostdev tracking.
//!
//! USB assignment has no stub driver, reset or original-state handling;
//! the manager only enforces exclusive ownership through the active
//! registry.

use slog::Logger;

use crate::device_set::DeviceKey;
use crate::error::{Error, Result};
use crate::manager::HostdevManager;
use crate::types::{DeviceOwner, HostdevDef, UsbHostdev};

/// Handle on one assigned USB device, identified by bus and device number.
#[derive(Clone, Debug)]
pub struct UsbDevice {
    bus: u32,
    device: u32,
    used_by: Option<DeviceOwner>,
}

impl DeviceKey for UsbDevice {
    type Key = (u32, u32);

    fn key(&self) -> (u32, u32) {
        (self.bus, self.device)
    }
}

impl UsbDevice {
    pub fn new(bus: u32, device: u32) -> Self {
        UsbDevice {
            bus,
            device,
            used_by: None,
        }
    }

    pub fn used_by(&self) -> Option<&DeviceOwner> {
        self.used_by.as_ref()
    }
}

/// Claims every USB hostdev in the list for the given guest, or none.
pub fn prepare_usb(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    hostdevs: &[HostdevDef],
) -> Result<()> {
    let mut active = mgr.active_usb.lock().unwrap();

    for hostdev in hostdevs {
        let usb = match hostdev {
            HostdevDef::Usb(usb) => usb,
            _ => continue,
        };
        if let Some(existing) = active.get(&(usb.bus, usb.device)) {
            let msg = match existing.used_by() {
                Some(owner) => format!(
                    "USB device {}:{} is in use by driver {}, domain {}",
                    usb.bus, usb.device, owner.drv_name, owner.dom_name
                ),
                None => format!("USB device {}:{} is already in use", usb.bus, usb.device),
            };
            return Err(Error::InvalidOperation(msg));
        }
    }

    let mut added: Vec<(u32, u32)> = Vec::new();
    for hostdev in hostdevs {
        let usb = match hostdev {
            HostdevDef::Usb(usb) => usb,
            _ => continue,
        };
        let mut dev = UsbDevice::new(usb.bus, usb.device);
        dev.used_by = Some(DeviceOwner::new(drv_name, dom_name));
        if active.add(dev).is_err() {
            for key in &added {
                active.steal(key);
            }
            return Err(Error::InvalidOperation(format!(
                "USB device {}:{} listed more than once",
                usb.bus, usb.device
            )));
        }
        added.push((usb.bus, usb.device));
    }

    if !added.is_empty() {
        debug!(logger, "prepared USB devices";
               "domain" => dom_name, "count" => added.len());
    }
    Ok(())
}

/// Releases the listed USB devices owned by the given guest. Devices held
/// by another guest are logged and left alone.
pub fn reattach_usb(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    hostdevs: &[HostdevDef],
) {
    let mut active = mgr.active_usb.lock().unwrap();

    for hostdev in hostdevs {
        let usb = match hostdev {
            HostdevDef::Usb(usb) => usb,
            _ => continue,
        };
        let key = (usb.bus, usb.device);
        match active.get(&key) {
            None => {
                debug!(logger, "USB device not active, nothing to release";
                       "bus" => usb.bus, "device" => usb.device);
            }
            Some(dev) => {
                let owned = dev
                    .used_by()
                    .map(|o| o.drv_name == drv_name && o.dom_name == dom_name)
                    .unwrap_or(false);
                if owned {
                    active.steal(&key);
                } else {
                    warn!(logger, "not releasing USB device owned by another domain";
                          "bus" => usb.bus, "device" => usb.device);
                }
            }
        }
    }
}
