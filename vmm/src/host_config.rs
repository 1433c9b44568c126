// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::BTreeMap;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use pci::{bar_offset, PciBdf, PciConfigAccess, PCI_COMMAND_OFFSET, PCI_CONFIG_SPACE_SIZE};

use crate::config::PciDeviceConfig;

type ConfigSpace = [u8; PCI_CONFIG_SPACE_SIZE];

/// Configuration spaces of the host PCI functions.
///
/// Accesses to a function that does not exist, or that cross the end of
/// the configuration space, read as all ones and are otherwise ignored,
/// like a master abort on a real bus.
#[derive(Default)]
pub struct HostConfigSpace {
    spaces: Mutex<BTreeMap<PciBdf, ConfigSpace>>,
}

impl HostConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: &[PciDeviceConfig]) -> Self {
        let host = Self::new();
        for device in devices {
            host.add_device(device);
        }
        host
    }

    /// Populates the configuration space of `device` with its BAR and
    /// command registers.
    pub fn add_device(&self, device: &PciDeviceConfig) {
        let mut space: ConfigSpace = [0; PCI_CONFIG_SPACE_SIZE];

        let command = PCI_COMMAND_OFFSET as usize;
        LittleEndian::write_u16(&mut space[command..command + 2], device.command);
        for (idx, bar) in device.bars.iter().enumerate() {
            let offset = bar_offset(idx) as usize;
            LittleEndian::write_u32(&mut space[offset..offset + 4], bar.raw);
        }

        self.spaces.lock().unwrap().insert(device.bdf, space);
    }
}

fn access_range(offset: u32, len: usize) -> Option<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start.checked_add(len)?;

    if !matches!(len, 1 | 2 | 4) || end > PCI_CONFIG_SPACE_SIZE {
        return None;
    }

    Some(start..end)
}

impl PciConfigAccess for HostConfigSpace {
    fn read_config(&self, bdf: PciBdf, offset: u32, data: &mut [u8]) {
        let spaces = self.spaces.lock().unwrap();

        match (spaces.get(&bdf), access_range(offset, data.len())) {
            (Some(space), Some(range)) => data.copy_from_slice(&space[range]),
            _ => {
                warn!(
                    "Invalid config read of {} at 0x{:x}, len {}",
                    bdf,
                    offset,
                    data.len()
                );
                data.fill(0xff);
            }
        }
    }

    fn write_config(&self, bdf: PciBdf, offset: u32, data: &[u8]) {
        let mut spaces = self.spaces.lock().unwrap();

        match (spaces.get_mut(&bdf), access_range(offset, data.len())) {
            (Some(space), Some(range)) => space[range].copy_from_slice(data),
            _ => warn!(
                "Invalid config write of {} at 0x{:x}, len {}",
                bdf,
                offset,
                data.len()
            ),
        }
    }
}
