// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Assignment manager for host devices passed through to guests.
//!
//! The manager owns the process-wide registries of PCI, USB and SCSI
//! devices handed to guests and drives the transactional PCI pipeline:
//! validate, detach from the host driver, reset, reconfigure SR-IOV VF
//! networking, and only then record the devices as guest-owned. A failure
//! anywhere rolls the host back to the state before the call.
//!
//! Entry points take an explicit [`HostdevManager`] so callers normally
//! pass [`default_manager`]`()` and tests inject their own.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate slog;

// Scoped fallback logger for code paths without a threaded logger.
macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "hostdev"))
    };
}

pub mod assign;
pub mod device;
pub mod device_set;
pub mod error;
pub mod manager;
pub mod netvf;
pub mod pci;
pub mod scsi;
pub mod types;
pub mod usb;

pub use assign::{prepare_pci, reattach_pci};
pub use device::{OriginalState, PciDevice, StubDriver};
pub use device_set::{DeviceKey, DeviceSet};
pub use error::{Error, Result};
pub use manager::{default_manager, HostdevManager, DEFAULT_PCI_SYSFS, DEFAULT_STATE_DIR};
pub use netvf::{IpLinkVfBackend, VfConfig, VfNetBackend};
pub use pci::PciAddress;
pub use scsi::{prepare_scsi, reattach_scsi};
pub use types::{
    DeviceOwner, HostdevDef, NetParent, PciHostdev, PciHostdevBackend, PortProfile, PrepareFlags,
    ScsiHostdev, UsbHostdev, VlanConfig,
};
pub use usb::{prepare_usb, reattach_usb};
