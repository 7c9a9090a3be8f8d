// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

//! PCI device addressing.

use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A PCI device address: domain, bus, slot and function.
///
/// The textual form is the one the kernel uses under
/// `/sys/bus/pci/devices`, e.g. `0000:03:00.1`. Ordering is lexicographic
/// over the 4-tuple, which matches the kernel's directory ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    pub fn new(domain: u32, bus: u8, slot: u8, function: u8) -> Self {
        PciAddress {
            domain,
            bus,
            slot,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidOperation(format!("malformed PCI address {:?}", s));

        let (rest, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let mut fields = rest.split(':');
        let domain = fields.next().ok_or_else(invalid)?;
        let bus = fields.next().ok_or_else(invalid)?;
        let slot = fields.next().ok_or_else(invalid)?;
        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(PciAddress {
            domain: u32::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| invalid())?,
            function: u8::from_str_radix(function, 16).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for PciAddress {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> String {
        addr.to_string()
    }
}
