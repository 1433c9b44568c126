// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::{BTreeMap, BTreeSet};
use std::result;

use pci::{PassthroughConfig, PciBdf, PciDeviceError, PhysicalDevice};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_device::VmId;

/// Errors associated with the platform description.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Two VMs share the same identifier.
    #[error("Duplicate VM identifier {0}")]
    DuplicateVmId(VmId),
    /// Two physical devices share the same address.
    #[error("Duplicate PCI device {0}")]
    DuplicateDevice(PciBdf),
    /// A VM passes through a device the host does not have.
    #[error("{0} passes through unknown PCI device {1}")]
    UnknownDevice(VmId, PciBdf),
    /// A device is passed through to more than one VM.
    #[error("PCI device {0} is assigned to both {1} and {2}")]
    DeviceAssignedTwice(PciBdf, VmId, VmId),
    /// The BAR table of a physical device is invalid.
    #[error("Invalid PCI device")]
    InvalidDevice(#[source] PciDeviceError),
    /// More preassigned bases than the device has BARs.
    #[error("{0} provides {1} BAR bases for PCI device {2} which has {3} BARs")]
    TooManyBarBases(VmId, usize, PciBdf, usize),
}

type ValidationResult<T> = result::Result<T, ValidationError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PciBarConfig {
    /// Register value as discovered on the host, flag bits included.
    pub raw: u32,
    #[serde(default)]
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PciDeviceConfig {
    pub bdf: PciBdf,
    pub bars: Vec<PciBarConfig>,
    /// Initial value of the command register.
    #[serde(default)]
    pub command: u16,
}

impl PciDeviceConfig {
    pub fn physical_device(&self) -> result::Result<PhysicalDevice, PciDeviceError> {
        let registers: Vec<(u32, u64)> = self.bars.iter().map(|b| (b.raw, b.size)).collect();
        PhysicalDevice::from_registers(self.bdf, &registers)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmConfig {
    pub id: VmId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub passthrough: Vec<PassthroughConfig>,
}

/// Static description of the host PCI devices and of the VMs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub pci_devices: Vec<PciDeviceConfig>,
    #[serde(default)]
    pub vms: Vec<VmConfig>,
}

impl PlatformConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        let mut bar_counts = BTreeMap::new();
        for device in self.pci_devices.iter() {
            let pdev = device
                .physical_device()
                .map_err(ValidationError::InvalidDevice)?;
            if bar_counts.insert(device.bdf, pdev.bar_count()).is_some() {
                return Err(ValidationError::DuplicateDevice(device.bdf));
            }
        }

        let mut vm_ids = BTreeSet::new();
        let mut owners: BTreeMap<PciBdf, VmId> = BTreeMap::new();
        for vm in self.vms.iter() {
            if !vm_ids.insert(vm.id) {
                return Err(ValidationError::DuplicateVmId(vm.id));
            }

            for passthrough in vm.passthrough.iter() {
                let bdf = passthrough.bdf;
                let bar_count = *bar_counts
                    .get(&bdf)
                    .ok_or(ValidationError::UnknownDevice(vm.id, bdf))?;

                if let Some(owner) = owners.insert(bdf, vm.id) {
                    return Err(ValidationError::DeviceAssignedTwice(bdf, owner, vm.id));
                }

                if passthrough.vbar_base.len() > bar_count {
                    return Err(ValidationError::TooManyBarBases(
                        vm.id,
                        passthrough.vbar_base.len(),
                        bdf,
                        bar_count,
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLATFORM: &str = r#"{
        "pci_devices": [
            {
                "bdf": "0000:00:02.0",
                "bars": [
                    { "raw": 4026531840, "size": 8192 },
                    { "raw": 3221225484, "size": 1048576 },
                    { "raw": 64 }
                ],
                "command": 6
            },
            {
                "bdf": "00:03.0",
                "bars": [ { "raw": 57345, "size": 32 } ]
            }
        ],
        "vms": [
            {
                "id": 1,
                "name": "guest",
                "passthrough": [
                    { "bdf": "0000:00:02.0", "vbar_base": [2147483648, 4294967296] }
                ]
            },
            { "id": 2 }
        ]
    }"#;

    fn platform() -> PlatformConfig {
        serde_json::from_str(PLATFORM).unwrap()
    }

    #[test]
    fn parse_platform() {
        let config = platform();

        assert_eq!(config.pci_devices.len(), 2);
        assert_eq!(config.pci_devices[0].bdf, PciBdf::new(0, 0, 2, 0));
        assert_eq!(config.pci_devices[0].command, 6);
        assert_eq!(config.pci_devices[0].bars[2].size, 0);
        assert_eq!(config.pci_devices[1].command, 0);

        assert_eq!(config.vms[0].id, VmId(1));
        assert_eq!(config.vms[0].name, "guest");
        assert_eq!(
            config.vms[0].passthrough[0].vbar_base,
            vec![0x8000_0000, 0x1_0000_0000]
        );
        assert!(config.vms[1].passthrough.is_empty());

        let pdev = config.pci_devices[0].physical_device().unwrap();
        assert_eq!(pdev.bar_count(), 3);
        assert!(pdev.bar(2).is_high_half());

        config.validate().unwrap();
    }

    #[test]
    fn duplicate_entries() {
        let mut config = platform();
        config.vms[1].id = VmId(1);
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateVmId(VmId(1)))
        ));

        let mut config = platform();
        config.pci_devices[1].bdf = config.pci_devices[0].bdf;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn invalid_assignments() {
        let mut config = platform();
        config.vms[1].passthrough = config.vms[0].passthrough.clone();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DeviceAssignedTwice(_, VmId(1), VmId(2)))
        ));

        let mut config = platform();
        config.vms[1]
            .passthrough
            .push(PassthroughConfig::new(PciBdf::new(0, 0, 4, 0), Vec::new()));
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnknownDevice(VmId(2), _))
        ));

        let mut config = platform();
        config.vms[0].passthrough[0].vbar_base = vec![0; 4];
        assert!(matches!(
            config.validate(),
            Err(ValidationError::TooManyBarBases(VmId(1), 4, _, 3))
        ));
    }

    #[test]
    fn invalid_device() {
        let mut config = platform();
        config.pci_devices[0].bars.pop();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidDevice(PciDeviceError::MissingHighHalf(_, 1)))
        ));

        let mut config = platform();
        config.pci_devices[1].bars.clear();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidDevice(PciDeviceError::NoBars(_)))
        ));
    }
}
