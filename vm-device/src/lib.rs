// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Interfaces between passthrough device emulation and the virtual machine
//! it is assigned to.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

mod translation;

pub use self::translation::{GuestMemoryMapper, MappingError, MappingFlags, Result};

/// Identifier of a virtual machine.
///
/// Devices refer to the VM owning them through this key only, the VM itself
/// lives in a registry owned by the attach/detach manager.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(transparent)]
pub struct VmId(pub u32);

impl Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

impl From<u32> for VmId {
    fn from(id: u32) -> Self {
        VmId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_id_serde() {
        let id: VmId = serde_json::from_str("3").unwrap();
        assert_eq!(id, VmId(3));
        assert_eq!(serde_json::to_string(&id).unwrap(), "3");
        assert_eq!(id.to_string(), "vm3");
    }
}
