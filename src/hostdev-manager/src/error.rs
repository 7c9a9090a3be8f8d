// Copyright (c) 2023 Ant Group
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

/// Errors reported by the host device manager, by kind.
///
/// Callers are expected to match on the variant; message text is for
/// operators and logs only.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested operation is not valid for the device's current state,
    /// e.g. the device is owned by another domain or fails the
    /// assignability probe.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A host-level operation (sysfs I/O, state directory handling,
    /// external primitive) failed.
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The device configuration asks for something this manager does not
    /// implement (port-profile variant, VLAN trunking on a VF, ...).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfig(String),

    /// Invariant violation. Indicates a bug in the manager itself.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
