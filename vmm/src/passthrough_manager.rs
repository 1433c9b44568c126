// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Registries of the physical PCI devices, of the VMs, and of the devices
//! each VM has been assigned.
//!
//! Passthrough devices refer to their VM and physical device by key only;
//! the manager resolves the keys on every guest access.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use pci::{
    is_bar_offset, PassthroughConfig, PassthroughDevice, PciBdf, PciConfigAccess, PhysicalDevice,
};
use vm_device::{GuestMemoryMapper, VmId};

use crate::{Error, Result};

pub struct PassthroughManager {
    host: Arc<dyn PciConfigAccess>,
    devices: BTreeMap<PciBdf, Arc<PhysicalDevice>>,
    vms: BTreeMap<VmId, Arc<dyn GuestMemoryMapper>>,
    attached: BTreeMap<PciBdf, (VmId, Arc<Mutex<PassthroughDevice>>)>,
}

impl PassthroughManager {
    pub fn new(host: Arc<dyn PciConfigAccess>) -> Self {
        PassthroughManager {
            host,
            devices: BTreeMap::new(),
            vms: BTreeMap::new(),
            attached: BTreeMap::new(),
        }
    }

    /// Registers a physical device discovered on the host.
    pub fn add_physical_device(&mut self, pdev: PhysicalDevice) -> Result<Arc<PhysicalDevice>> {
        let bdf = pdev.bdf();
        if self.devices.contains_key(&bdf) {
            return Err(Error::DeviceExists(bdf));
        }

        let pdev = Arc::new(pdev);
        self.devices.insert(bdf, pdev.clone());
        debug!("Registered PCI device {} with {} BARs", bdf, pdev.bar_count());

        Ok(pdev)
    }

    pub fn physical_device(&self, bdf: PciBdf) -> Option<&Arc<PhysicalDevice>> {
        self.devices.get(&bdf)
    }

    pub fn create_vm(&mut self, vm: VmId, mapper: Arc<dyn GuestMemoryMapper>) -> Result<()> {
        if self.vms.contains_key(&vm) {
            return Err(Error::VmExists(vm));
        }

        self.vms.insert(vm, mapper);
        info!("Created {}", vm);

        Ok(())
    }

    /// Detaches every device of `vm`, tearing down their mappings, then
    /// forgets the VM.
    pub fn destroy_vm(&mut self, vm: VmId) -> Result<()> {
        let mapper = self.mapper(vm)?.clone();

        for bdf in self.vm_devices(vm) {
            if let Some((_, device)) = self.attached.remove(&bdf) {
                device.lock().unwrap().detach(mapper.as_ref());
            }
        }

        self.vms.remove(&vm);
        info!("Destroyed {}", vm);

        Ok(())
    }

    pub fn vms(&self) -> impl Iterator<Item = VmId> + '_ {
        self.vms.keys().copied()
    }

    pub fn mapper(&self, vm: VmId) -> Result<&Arc<dyn GuestMemoryMapper>> {
        self.vms.get(&vm).ok_or(Error::UnknownVm(vm))
    }

    /// Assigns the physical device named by `config` to `vm`.
    pub fn attach_device(&mut self, vm: VmId, config: PassthroughConfig) -> Result<()> {
        let bdf = config.bdf;
        let mapper = self.mapper(vm)?.clone();
        let pdev = self
            .devices
            .get(&bdf)
            .cloned()
            .ok_or(Error::UnknownDevice(bdf))?;

        if let Some((owner, _)) = self.attached.get(&bdf) {
            return Err(Error::DeviceAssigned(bdf, *owner));
        }

        let device =
            PassthroughDevice::attach(vm, pdev, config, mapper.as_ref(), self.host.as_ref());
        self.attached
            .insert(bdf, (vm, Arc::new(Mutex::new(device))));

        Ok(())
    }

    pub fn detach_device(&mut self, vm: VmId, bdf: PciBdf) -> Result<()> {
        let mapper = self.mapper(vm)?.clone();

        match self.attached.get(&bdf) {
            Some((owner, _)) if *owner == vm => {}
            _ => return Err(Error::NotAttached(bdf, vm)),
        }

        if let Some((_, device)) = self.attached.remove(&bdf) {
            device.lock().unwrap().detach(mapper.as_ref());
        }

        Ok(())
    }

    /// Devices assigned to `vm`, sorted by address.
    pub fn vm_devices(&self, vm: VmId) -> Vec<PciBdf> {
        self.attached
            .iter()
            .filter(|(_, (owner, _))| *owner == vm)
            .map(|(bdf, _)| *bdf)
            .collect()
    }

    pub fn device(&self, vm: VmId, bdf: PciBdf) -> Result<&Arc<Mutex<PassthroughDevice>>> {
        match self.attached.get(&bdf) {
            Some((owner, device)) if *owner == vm => Ok(device),
            _ => Err(Error::NotAttached(bdf, vm)),
        }
    }

    /// Guest read of the configuration space of an assigned device.
    ///
    /// Returns `None` for offsets outside of the BAR window, which are left
    /// to the generic configuration space emulation.
    pub fn read_config(
        &self,
        vm: VmId,
        bdf: PciBdf,
        offset: u32,
        width: usize,
    ) -> Result<Option<u32>> {
        let device = self.device(vm, bdf)?;
        if !is_bar_offset(offset) {
            return Ok(None);
        }

        Ok(Some(device.lock().unwrap().read_config(offset, width)))
    }

    /// Guest write to the configuration space of an assigned device.
    ///
    /// Returns whether the write targeted the BAR window and was handled.
    pub fn write_config(
        &self,
        vm: VmId,
        bdf: PciBdf,
        offset: u32,
        width: usize,
        value: u32,
    ) -> Result<bool> {
        let device = self.device(vm, bdf)?;
        if !is_bar_offset(offset) {
            return Ok(false);
        }

        let mapper = self.mapper(vm)?;
        device
            .lock()
            .unwrap()
            .write_config(offset, width, value, mapper.as_ref());

        Ok(true)
    }
}
