// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::collections::BTreeMap;
use std::result;
use std::sync::Arc;

use pci::{BarKind, PciBdf, PciDeviceError};
use serde::Serialize;
use thiserror::Error;
use vm_device::VmId;
use vm_memory::Address;

use crate::config::{PlatformConfig, ValidationError};
use crate::guest_mappings::GuestMappings;
use crate::host_config::HostConfigSpace;
use crate::passthrough_manager::PassthroughManager;
use crate::trace::{AccessRecord, GuestAccess};

pub mod config;
pub mod guest_mappings;
pub mod host_config;
pub mod passthrough_manager;
pub mod trace;

/// Errors associated with VM and device management.
#[derive(Debug, Error)]
pub enum Error {
    /// No VM with this identifier.
    #[error("Unknown VM {0}")]
    UnknownVm(VmId),

    /// A VM with this identifier already exists.
    #[error("VM {0} already exists")]
    VmExists(VmId),

    /// No physical device at this address.
    #[error("Unknown PCI device {0}")]
    UnknownDevice(PciBdf),

    /// A physical device at this address is already registered.
    #[error("PCI device {0} already registered")]
    DeviceExists(PciBdf),

    /// The device is already passed through to a VM.
    #[error("PCI device {0} is already assigned to {1}")]
    DeviceAssigned(PciBdf, VmId),

    /// The device is not passed through to this VM.
    #[error("PCI device {0} is not attached to {1}")]
    NotAttached(PciBdf, VmId),

    /// Cannot build a physical device.
    #[error("Error creating physical PCI device")]
    PhysicalDevice(#[source] PciDeviceError),

    /// The platform description is invalid.
    #[error("Invalid platform configuration")]
    InvalidConfig(#[source] ValidationError),
}
pub type Result<T> = result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BarReport {
    pub index: usize,
    pub kind: BarKind,
    pub raw: u32,
    pub size: u64,
    pub mapped_gpa: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub bdf: PciBdf,
    /// Command register of the physical device.
    pub command: u16,
    pub bars: Vec<BarReport>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MappingReport {
    pub gpa: u64,
    pub hpa: u64,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VmReport {
    pub id: VmId,
    pub name: String,
    pub mappings: Vec<MappingReport>,
    pub devices: Vec<DeviceReport>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub vms: Vec<VmReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accesses: Vec<AccessRecord>,
}

/// The VMs of a platform together with their passthrough devices.
pub struct Vmm {
    names: BTreeMap<VmId, String>,
    host: Arc<HostConfigSpace>,
    mappings: BTreeMap<VmId, Arc<GuestMappings>>,
    manager: PassthroughManager,
}

impl Vmm {
    /// Builds every VM of `config` and attaches its passthrough devices.
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidConfig)?;

        let host = Arc::new(HostConfigSpace::from_devices(&config.pci_devices));
        let mut manager = PassthroughManager::new(host.clone());
        for device in config.pci_devices.iter() {
            let pdev = device.physical_device().map_err(Error::PhysicalDevice)?;
            manager.add_physical_device(pdev)?;
        }

        let mut names = BTreeMap::new();
        let mut mappings = BTreeMap::new();
        for vm in config.vms.iter() {
            let guest_mappings = Arc::new(GuestMappings::new());
            manager.create_vm(vm.id, guest_mappings.clone())?;
            mappings.insert(vm.id, guest_mappings);
            names.insert(vm.id, vm.name.clone());

            for passthrough in vm.passthrough.iter() {
                manager.attach_device(vm.id, passthrough.clone())?;
            }
        }

        Ok(Vmm {
            names,
            host,
            mappings,
            manager,
        })
    }

    pub fn manager(&self) -> &PassthroughManager {
        &self.manager
    }

    pub fn host(&self) -> &HostConfigSpace {
        &self.host
    }

    pub fn replay(&self, trace: &[GuestAccess]) -> Result<Vec<AccessRecord>> {
        trace::replay(&self.manager, trace)
    }

    /// Destroys every VM, removing the mappings of their devices. Destroyed
    /// VMs no longer appear in the report.
    pub fn destroy_vms(&mut self) -> Result<()> {
        let vms: Vec<VmId> = self.manager.vms().collect();
        for vm in vms {
            self.manager.destroy_vm(vm)?;
            self.mappings.remove(&vm);
            self.names.remove(&vm);
        }

        Ok(())
    }

    pub fn report(&self) -> Report {
        let mut vms = Vec::new();

        for (id, guest_mappings) in self.mappings.iter() {
            let mappings = guest_mappings
                .snapshot()
                .into_iter()
                .map(|m| MappingReport {
                    gpa: m.gpa.raw_value(),
                    hpa: m.hpa,
                    size: m.size,
                })
                .collect();

            let devices = self
                .manager
                .vm_devices(*id)
                .into_iter()
                .filter_map(|bdf| self.device_report(*id, bdf))
                .collect();

            vms.push(VmReport {
                id: *id,
                name: self.names.get(id).cloned().unwrap_or_default(),
                mappings,
                devices,
            });
        }

        Report {
            vms,
            accesses: Vec::new(),
        }
    }

    fn device_report(&self, vm: VmId, bdf: PciBdf) -> Option<DeviceReport> {
        use pci::{PciConfigAccess, PCI_COMMAND_OFFSET};

        let device = self.manager.device(vm, bdf).ok()?;
        let device = device.lock().unwrap();

        let bars = device
            .bars()
            .iter()
            .enumerate()
            .map(|(index, bar)| BarReport {
                index,
                kind: bar.kind(),
                raw: bar.raw(),
                size: bar.size(),
                mapped_gpa: bar.mapped_gpa().map(|gpa| gpa.raw_value()),
            })
            .collect();

        Some(DeviceReport {
            bdf,
            command: self.host.read_config_word(bdf, PCI_COMMAND_OFFSET),
            bars,
        })
    }
}
