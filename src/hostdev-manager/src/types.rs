// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host device definitions handed in by the domain-definition collaborator.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device::OriginalState;
use crate::pci::PciAddress;

/// Identity of the guest currently owning a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOwner {
    pub drv_name: String,
    pub dom_name: String,
}

impl DeviceOwner {
    pub fn new(drv_name: &str, dom_name: &str) -> Self {
        DeviceOwner {
            drv_name: drv_name.to_string(),
            dom_name: dom_name.to_string(),
        }
    }
}

/// Which stub backend the domain asked for on a PCI hostdev.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PciHostdevBackend {
    /// Bind through vfio-pci.
    Vfio,
    /// Legacy KVM assignment through pci-stub.
    Kvm,
}

impl Default for PciHostdevBackend {
    fn default() -> Self {
        PciHostdevBackend::Vfio
    }
}

/// Guest-requested VLAN configuration for an SR-IOV VF.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanConfig {
    #[serde(default)]
    pub trunk: bool,
    #[serde(default)]
    pub tags: Vec<u16>,
}

impl VlanConfig {
    /// The single VLAN tag of a non-trunking config, if one is set.
    pub fn single_tag(&self) -> Option<u16> {
        if self.trunk {
            None
        } else {
            self.tags.first().copied()
        }
    }
}

/// A virtual-port profile negotiated with the upstream switch.
///
/// The matrix is kept exhaustive on purpose; arms other than 802.1Qbh are
/// rejected with an unsupported-configuration error at the point of use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PortProfile {
    #[serde(rename = "802.1Qbg")]
    Qbg {
        manager_id: u8,
        type_id: u32,
        type_id_version: u8,
        instance_id: String,
    },
    #[serde(rename = "802.1Qbh")]
    Qbh { profile_id: String },
    #[serde(rename = "openvswitch")]
    OpenVswitch {
        interface_id: String,
        profile_id: Option<String>,
    },
    #[serde(rename = "midonet")]
    Midonet { interface_id: String },
}

impl PortProfile {
    pub fn type_name(&self) -> &'static str {
        match self {
            PortProfile::Qbg { .. } => "802.1Qbg",
            PortProfile::Qbh { .. } => "802.1Qbh",
            PortProfile::OpenVswitch { .. } => "openvswitch",
            PortProfile::Midonet { .. } => "midonet",
        }
    }
}

/// The guest network interface a VF hostdev hangs off.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetParent {
    /// Guest-requested MAC, `aa:bb:cc:dd:ee:ff` form.
    pub mac: String,
    #[serde(default)]
    pub vlan: Option<VlanConfig>,
    #[serde(default)]
    pub virt_port: Option<PortProfile>,
}

/// A PCI hostdev as defined by the domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PciHostdev {
    pub addr: PciAddress,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub backend: PciHostdevBackend,
    /// Present when the hostdev is the backing of a guest network
    /// interface (SR-IOV VF assignment).
    #[serde(default)]
    pub net: Option<NetParent>,
    /// Filled in by a successful prepare so the caller can persist the
    /// kernel-level state to restore on reattach.
    #[serde(default)]
    pub origstate: Option<OriginalState>,
}

/// A USB hostdev, identified by bus and device number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbHostdev {
    pub bus: u32,
    pub device: u32,
}

/// A SCSI hostdev, identified by host adapter, bus, target and unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiHostdev {
    pub host: u32,
    pub bus: u32,
    pub target: u32,
    pub lun: u64,
}

/// One host device passed through to a guest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subsys", rename_all = "lowercase")]
pub enum HostdevDef {
    Pci(PciHostdev),
    Usb(UsbHostdev),
    Scsi(ScsiHostdev),
}

impl HostdevDef {
    pub fn as_pci(&self) -> Option<&PciHostdev> {
        match self {
            HostdevDef::Pci(pci) => Some(pci),
            _ => None,
        }
    }

    pub fn as_pci_mut(&mut self) -> Option<&mut PciHostdev> {
        match self {
            HostdevDef::Pci(pci) => Some(pci),
            _ => None,
        }
    }
}

bitflags! {
    /// Options accepted by the PCI prepare pipeline.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PrepareFlags: u32 {
        /// Require IOMMU/ACS isolation when probing assignability.
        const STRICT_ACS_CHECK = 1 << 0;
    }
}
