// Copyright (c) 2023 Ant Group
// Copyright (c) 2023 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! The PCI assignment pipelines.
//!
//! [`prepare_pci`] transfers a set of PCI devices from the host to a guest
//! as one atomic unit; any failure reverts every side effect already made.
//! [`reattach_pci`] is the best-effort inverse. Both hold the manager's
//! active-PCI lock, then the inactive-PCI lock, for the whole operation,
//! which serializes all PCI device state transitions on the host.

use slog::Logger;

use crate::device::{PciDevice, StubDriver};
use crate::device_set::DeviceSet;
use crate::error::{Error, Result};
use crate::manager::HostdevManager;
use crate::netvf;
use crate::pci::PciAddress;
use crate::types::{DeviceOwner, HostdevDef, PciHostdevBackend, PrepareFlags};

/// Marker file the legacy KVM assignment leaves behind while it still
/// holds a device.
const KVM_CLEANUP_MARKER: &str = "kvm_assigned_device";

/// Validates, detaches, resets and reconfigures every PCI hostdev in the
/// list, then records them as owned by the given guest.
///
/// On failure the registries and the kernel-level state of every touched
/// device are rolled back; rollback problems are logged, never returned.
/// The original-state of each device is written back into the hostdev
/// definitions so the caller can persist it.
pub fn prepare_pci(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    dom_uuid: &str,
    hostdevs: &mut [HostdevDef],
    flags: PrepareFlags,
) -> Result<()> {
    let mut active = mgr.active_pci.lock().unwrap();
    let mut inactive = mgr.inactive_pci.lock().unwrap();

    // Materialize the working set, one handle per PCI hostdev.
    let mut working: DeviceSet<PciDevice> = DeviceSet::new();
    for hostdev in hostdevs.iter() {
        let pci = match hostdev.as_pci() {
            Some(pci) => pci,
            None => continue,
        };
        let mut dev = PciDevice::new(mgr.pci_sysfs(), pci.addr)?;
        dev.set_managed(pci.managed);
        dev.set_stub_driver(match pci.backend {
            PciHostdevBackend::Vfio => StubDriver::VfioPci,
            PciHostdevBackend::Kvm => StubDriver::PciStub,
        });
        if let Err(dup) = working.add(dev) {
            return Err(Error::InvalidOperation(format!(
                "PCI device {} listed more than once",
                dup.addr()
            )));
        }
    }

    // Validate. Nothing is mutated before this phase passes.
    let strict_acs = flags.contains(PrepareFlags::STRICT_ACS_CHECK);
    for dev in working.iter() {
        if !dev.is_assignable(strict_acs) {
            return Err(Error::InvalidOperation(format!(
                "PCI device {} is not assignable",
                dev.addr()
            )));
        }
        if let Some(existing) = active.get(&dev.addr()) {
            let msg = match existing.used_by() {
                Some(owner) => format!(
                    "PCI device {} is in use by driver {}, domain {}",
                    dev.addr(),
                    owner.drv_name,
                    owner.dom_name
                ),
                None => format!("PCI device {} is already in use", dev.addr()),
            };
            return Err(Error::InvalidOperation(msg));
        }
    }
    for hostdev in hostdevs.iter() {
        if let Some(net) = hostdev.as_pci().and_then(|pci| pci.net.as_ref()) {
            netvf::validate_net_config(net)?;
        }
    }

    // Detach every managed device from its host driver.
    let mut detach_err: Option<Error> = None;
    for dev in working.iter_mut() {
        if !dev.managed() {
            continue;
        }
        if let Err(e) = dev.detach(&active, &inactive) {
            detach_err = Some(e);
            break;
        }
    }
    if let Some(e) = detach_err {
        rollback_reattach(&working, &active, &inactive, logger);
        return Err(e);
    }

    // Reset all devices. This must come strictly after every detach: a
    // reset can affect sibling functions on the same slot or bus, and a
    // still-attached sibling would disturb the host.
    let mut reset_err: Option<Error> = None;
    for dev in working.iter() {
        if let Err(e) = dev.reset(&active, &inactive) {
            reset_err = Some(e);
            break;
        }
    }
    if let Some(e) = reset_err {
        rollback_reattach(&working, &active, &inactive, logger);
        return Err(e);
    }

    // Reconfigure VF networking, tracking the high-water mark for
    // rollback.
    let mut last_processed_vf: usize = 0;
    for (i, hostdev) in hostdevs.iter().enumerate() {
        if let Some(pci) = hostdev.as_pci() {
            if let Err(e) = netvf::replace_net_config(
                mgr.pci_sysfs(),
                mgr.state_dir(),
                mgr.net_backend(),
                logger,
                pci,
                dom_uuid,
            ) {
                rollback_restore_net(mgr, logger, hostdevs, last_processed_vf);
                rollback_reattach(&working, &active, &inactive, logger);
                return Err(e);
            }
        }
        last_processed_vf = i;
    }

    // Activate: install a handle for every device in the active registry.
    let mut activated: Vec<PciAddress> = Vec::new();
    let mut activate_err: Option<Error> = None;
    for dev in working.iter() {
        match active.add(dev.clone()) {
            Ok(()) => activated.push(dev.addr()),
            Err(dup) => {
                activate_err = Some(Error::Internal(format!(
                    "device {} appeared in the active registry during activation",
                    dup.addr()
                )));
                break;
            }
        }
    }
    if let Some(e) = activate_err {
        for addr in &activated {
            active.steal(addr);
        }
        rollback_restore_net(mgr, logger, hostdevs, last_processed_vf);
        rollback_reattach(&working, &active, &inactive, logger);
        return Err(e);
    }

    // The devices are owned by a guest now; they can no longer be
    // tracked as detached-but-unused.
    for dev in working.iter() {
        inactive.steal(&dev.addr());
    }

    // Stamp ownership and hand the captured original state back to the
    // caller for persistence.
    for hostdev in hostdevs.iter_mut() {
        let pci = match hostdev.as_pci_mut() {
            Some(pci) => pci,
            None => continue,
        };
        if let Some(dev) = active.get_mut(&pci.addr) {
            dev.set_used_by(DeviceOwner::new(drv_name, dom_name));
        }
        pci.origstate = working.get(&pci.addr).and_then(|d| d.original_state());
    }

    // The registry owns the devices now; drain the local working set.
    let count = working.len();
    while working.pop_first().is_some() {}

    info!(logger, "prepared PCI devices for guest";
          "driver" => drv_name, "domain" => dom_name, "count" => count);
    Ok(())
}

/// Returns the listed PCI devices owned by the given guest to the host.
///
/// Nothing here is fatal: devices owned by other guests are skipped, and
/// per-device failures are logged while the remaining devices are still
/// processed.
pub fn reattach_pci(
    mgr: &HostdevManager,
    logger: &Logger,
    drv_name: &str,
    dom_name: &str,
    hostdevs: &[HostdevDef],
    legacy_state_dir: Option<&std::path::Path>,
) {
    let mut active = mgr.active_pci.lock().unwrap();
    let mut inactive = mgr.inactive_pci.lock().unwrap();

    // Claim from the active registry every listed device this guest
    // actually owns. Removal must precede reset, so no observer can see a
    // device as active while it is transiently being reset.
    let mut working: DeviceSet<PciDevice> = DeviceSet::new();
    for hostdev in hostdevs {
        let pci = match hostdev.as_pci() {
            Some(pci) => pci,
            None => continue,
        };
        let owned = match active.get(&pci.addr) {
            None => {
                debug!(logger, "device not active, nothing to reattach";
                       "device" => %pci.addr);
                continue;
            }
            Some(dev) => dev
                .used_by()
                .map(|o| o.drv_name == drv_name && o.dom_name == dom_name)
                .unwrap_or(false),
        };
        if !owned {
            warn!(logger, "not reattaching device owned by another domain";
                  "device" => %pci.addr);
            continue;
        }
        if let Some(dev) = active.steal(&pci.addr) {
            let _ = working.add(dev);
        }
    }

    // Restore VF network configuration for every hostdev in the list.
    for hostdev in hostdevs {
        if let Some(pci) = hostdev.as_pci() {
            if let Err(e) = netvf::restore_net_config(
                mgr.pci_sysfs(),
                mgr.state_dir(),
                legacy_state_dir,
                mgr.net_backend(),
                logger,
                pci,
            ) {
                warn!(logger, "failed to restore VF network configuration";
                      "device" => %pci.addr, "error" => %e);
            }
        }
    }

    for dev in working.iter() {
        if let Err(e) = dev.reset(&active, &inactive) {
            warn!(logger, "failed to reset PCI device";
                  "device" => %dev.addr(), "error" => %e);
        }
    }

    while let Some(dev) = working.pop_first() {
        reattach_single(logger, dev, &active, &mut inactive);
    }
}

/// Hands one device, already removed from the active registry, back to
/// the host. All errors are swallowed after logging.
fn reattach_single(
    logger: &Logger,
    mut dev: PciDevice,
    active: &DeviceSet<PciDevice>,
    inactive: &mut DeviceSet<PciDevice>,
) {
    if !dev.managed() {
        // Unmanaged devices stay detached; the admin prepared them and
        // the admin will reclaim them.
        dev.clear_used_by();
        if let Err(dup) = inactive.add(dev) {
            debug!(logger, "device already tracked as inactive";
                   "device" => %dup.addr());
        }
        return;
    }

    if dev.stub_driver() == StubDriver::PciStub {
        // Legacy KVM assignment releases the device asynchronously.
        dev.wait_for_cleanup(KVM_CLEANUP_MARKER);
    }

    if let Err(e) = dev.reattach(active, inactive) {
        warn!(logger, "failed to reattach PCI device";
              "device" => %dev.addr(), "error" => %e);
    }
}

fn rollback_restore_net(
    mgr: &HostdevManager,
    logger: &Logger,
    hostdevs: &[HostdevDef],
    bound: usize,
) {
    for hostdev in hostdevs.iter().take(bound) {
        if let Some(pci) = hostdev.as_pci() {
            if let Err(e) = netvf::restore_net_config(
                mgr.pci_sysfs(),
                mgr.state_dir(),
                None,
                mgr.net_backend(),
                logger,
                pci,
            ) {
                warn!(logger, "failed to restore VF network configuration during rollback";
                      "device" => %pci.addr, "error" => %e);
            }
        }
    }
}

fn rollback_reattach(
    working: &DeviceSet<PciDevice>,
    active: &DeviceSet<PciDevice>,
    inactive: &DeviceSet<PciDevice>,
    logger: &Logger,
) {
    for dev in working.iter() {
        if let Err(e) = dev.reattach(active, inactive) {
            warn!(logger, "failed to reattach PCI device during rollback, \
                   the host may need manual intervention";
                  "device" => %dev.addr(), "error" => %e);
        }
    }
}
