// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use crate::PciBdf;

/// Size of the conventional configuration space of a PCI function.
pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
// PCI config register size (4 bytes).
const PCI_CONFIG_REGISTER_SIZE: u32 = 4;

pub const PCI_COMMAND_OFFSET: u32 = 0x04;
/// Interrupt Disable bit of the command register.
pub const PCI_COMMAND_INTX_DISABLE: u16 = 0x400;

// First BAR offset in the PCI config space.
pub const PCI_CONFIG_BAR_OFFSET: u32 = 0x10;
// Number of BARs for a type 0 PCI device.
pub const NUM_BAR_REGS: usize = 6;
pub const PCI_CONFIG_BAR_END: u32 =
    PCI_CONFIG_BAR_OFFSET + NUM_BAR_REGS as u32 * PCI_CONFIG_REGISTER_SIZE;

/// Configuration space offset of BAR `idx`.
pub fn bar_offset(idx: usize) -> u32 {
    PCI_CONFIG_BAR_OFFSET + idx as u32 * PCI_CONFIG_REGISTER_SIZE
}

/// Whether `offset` falls inside the BAR window of a type 0 header.
pub fn is_bar_offset(offset: u32) -> bool {
    (PCI_CONFIG_BAR_OFFSET..PCI_CONFIG_BAR_END).contains(&offset)
}

/// Index of the BAR register containing `offset`.
pub fn bar_index(offset: u32) -> Option<usize> {
    if !is_bar_offset(offset) {
        return None;
    }

    Some(((offset - PCI_CONFIG_BAR_OFFSET) / PCI_CONFIG_REGISTER_SIZE) as usize)
}

/// Access to the configuration space of the physical devices of the host.
///
/// All accesses are little endian, `data.len()` gives the access width.
pub trait PciConfigAccess: Send + Sync {
    fn read_config(&self, bdf: PciBdf, offset: u32, data: &mut [u8]);

    fn write_config(&self, bdf: PciBdf, offset: u32, data: &[u8]);

    fn read_config_byte(&self, bdf: PciBdf, offset: u32) -> u8 {
        let mut data: [u8; 1] = [0];
        self.read_config(bdf, offset, &mut data);
        data[0]
    }

    fn read_config_word(&self, bdf: PciBdf, offset: u32) -> u16 {
        let mut data: [u8; 2] = [0, 0];
        self.read_config(bdf, offset, &mut data);
        u16::from_le_bytes(data)
    }

    fn read_config_dword(&self, bdf: PciBdf, offset: u32) -> u32 {
        let mut data: [u8; 4] = [0, 0, 0, 0];
        self.read_config(bdf, offset, &mut data);
        u32::from_le_bytes(data)
    }

    fn write_config_word(&self, bdf: PciBdf, offset: u32, value: u16) {
        let data: [u8; 2] = value.to_le_bytes();
        self.write_config(bdf, offset, &data)
    }

    fn write_config_dword(&self, bdf: PciBdf, offset: u32, value: u32) {
        let data: [u8; 4] = value.to_le_bytes();
        self.write_config(bdf, offset, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_window() {
        assert_eq!(bar_offset(0), 0x10);
        assert_eq!(bar_offset(5), 0x24);
        assert_eq!(PCI_CONFIG_BAR_END, 0x28);

        assert_eq!(bar_index(0x0c), None);
        assert_eq!(bar_index(0x10), Some(0));
        assert_eq!(bar_index(0x13), Some(0));
        assert_eq!(bar_index(0x14), Some(1));
        assert_eq!(bar_index(0x27), Some(5));
        assert_eq!(bar_index(0x28), None);
    }
}
