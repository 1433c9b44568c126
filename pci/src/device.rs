// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use thiserror::Error;

use crate::bar::{compose_base, decode_kind, BarKind, BAR_IO_ADDR_MASK};
use crate::configuration::{bar_offset, NUM_BAR_REGS};
use crate::PciBdf;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Device {0} has no BAR")]
    NoBars(PciBdf),
    #[error("Device {0} has {1} BARs, at most 6 are supported")]
    TooManyBars(PciBdf, usize),
    #[error("BAR {1} of device {0} is the upper half of a 64-bit BAR without lower half")]
    DanglingHighHalf(PciBdf, usize),
    #[error("BAR {1} of device {0} is a 64-bit BAR without upper half")]
    MissingHighHalf(PciBdf, usize),
    #[error("BAR {1} of device {0} has a size of 0x{2:x}, not a power of two")]
    BarSizeInvalid(PciBdf, usize, u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A BAR of a physical device, as discovered on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalBar {
    offset: u32,
    raw: u32,
    size: u64,
    kind: BarKind,
}

impl PhysicalBar {
    pub fn new(idx: usize, raw: u32, size: u64, kind: BarKind) -> Self {
        PhysicalBar {
            offset: bar_offset(idx),
            raw,
            size,
            kind,
        }
    }

    /// Configuration space offset of the register.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Size in bytes, 0 for the upper half of a 64-bit BAR.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> BarKind {
        self.kind
    }

    pub fn is_high_half(&self) -> bool {
        self.kind.is_high_half()
    }
}

/// A physical PCI function and its BAR table.
///
/// The table is immutable once built and shared by every passthrough
/// device attached to this function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalDevice {
    bdf: PciBdf,
    bars: Vec<PhysicalBar>,
}

impl PhysicalDevice {
    /// Builds a device from an explicit BAR table, checking that every
    /// 64-bit BAR is made of a lower half immediately followed by its upper
    /// half.
    pub fn new(bdf: PciBdf, bars: Vec<PhysicalBar>) -> Result<Self> {
        if bars.is_empty() {
            return Err(Error::NoBars(bdf));
        }
        if bars.len() > NUM_BAR_REGS {
            return Err(Error::TooManyBars(bdf, bars.len()));
        }

        for (idx, bar) in bars.iter().enumerate() {
            match bar.kind {
                BarKind::Mem64High => {
                    if idx == 0 || bars[idx - 1].kind != BarKind::Mem64Low {
                        return Err(Error::DanglingHighHalf(bdf, idx));
                    }
                }
                BarKind::Mem64Low => {
                    if bars.get(idx + 1).map(|b| b.kind) != Some(BarKind::Mem64High) {
                        return Err(Error::MissingHighHalf(bdf, idx));
                    }
                }
                _ => {}
            }

            if bar.kind.owns_mapping() && bar.size != 0 && !bar.size.is_power_of_two() {
                return Err(Error::BarSizeInvalid(bdf, idx, bar.size));
            }
        }

        Ok(PhysicalDevice { bdf, bars })
    }

    /// Builds a device from the raw register values and sizes of its BARs,
    /// in register order.
    ///
    /// Kinds are decoded the way BAR discovery walks the registers: the
    /// register following a 64-bit BAR is its upper half, and a register of
    /// size 0 is unimplemented.
    pub fn from_registers(bdf: PciBdf, registers: &[(u32, u64)]) -> Result<Self> {
        let mut bars = Vec::with_capacity(registers.len());
        let mut high_half_next = false;

        for (idx, &(raw, size)) in registers.iter().enumerate() {
            let kind = if high_half_next {
                high_half_next = false;
                BarKind::Mem64High
            } else {
                match decode_kind(raw) {
                    BarKind::Mem64Low => {
                        high_half_next = true;
                        BarKind::Mem64Low
                    }
                    _ if size == 0 => BarKind::None,
                    kind => kind,
                }
            };

            // The upper half never owns a size.
            let size = if kind.is_high_half() { 0 } else { size };
            bars.push(PhysicalBar::new(idx, raw, size, kind));
        }

        Self::new(bdf, bars)
    }

    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    pub fn bars(&self) -> &[PhysicalBar] {
        &self.bars
    }

    pub fn bar(&self, idx: usize) -> &PhysicalBar {
        &self.bars[idx]
    }

    /// Host physical base address of BAR `idx`. For either half of a 64-bit
    /// BAR this is the full 64-bit base.
    pub fn bar_base(&self, idx: usize) -> u64 {
        let bar = &self.bars[idx];

        match bar.kind {
            BarKind::Mem32 => compose_base(bar.raw, 0, bar.size),
            BarKind::Mem64Low => compose_base(bar.raw, self.bars[idx + 1].raw, bar.size),
            BarKind::Mem64High => {
                debug_assert!(idx > 0, "upper half of a 64-bit BAR at index 0");
                let low = &self.bars[idx - 1];
                compose_base(low.raw, bar.raw, low.size)
            }
            BarKind::Io => u64::from(bar.raw & BAR_IO_ADDR_MASK),
            BarKind::None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bdf() -> PciBdf {
        PciBdf::new(0, 0, 3, 0)
    }

    #[test]
    fn from_registers_decodes_kinds() {
        let pdev = PhysicalDevice::from_registers(
            bdf(),
            &[
                (0xf000_0000, 0x2000),
                (0xc000_000c, 0x10_0000),
                (0x0000_0040, 0),
                (0x0000_e001, 0x20),
                (0x0000_0000, 0),
            ],
        )
        .unwrap();

        let kinds: Vec<BarKind> = pdev.bars().iter().map(|b| b.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                BarKind::Mem32,
                BarKind::Mem64Low,
                BarKind::Mem64High,
                BarKind::Io,
                BarKind::None
            ]
        );
        assert!(pdev.bar(2).is_high_half());
        assert_eq!(pdev.bar(2).offset(), 0x18);
        assert_eq!(pdev.bar_count(), 5);

        assert_eq!(pdev.bar_base(0), 0xf000_0000);
        assert_eq!(pdev.bar_base(1), 0x40_c000_0000);
        assert_eq!(pdev.bar_base(2), 0x40_c000_0000);
        assert_eq!(pdev.bar_base(3), 0xe000);
        assert_eq!(pdev.bar_base(4), 0);
    }

    #[test]
    fn invalid_bar_tables() {
        assert_eq!(
            PhysicalDevice::from_registers(bdf(), &[]),
            Err(Error::NoBars(bdf()))
        );
        assert_eq!(
            PhysicalDevice::from_registers(bdf(), &[(0, 0); 7]),
            Err(Error::TooManyBars(bdf(), 7))
        );
        assert_eq!(
            PhysicalDevice::from_registers(bdf(), &[(0xf000_0000, 0x2000), (0xc000_0004, 0x4000)]),
            Err(Error::MissingHighHalf(bdf(), 1))
        );
        assert_eq!(
            PhysicalDevice::from_registers(bdf(), &[(0xf000_0000, 0x3000)]),
            Err(Error::BarSizeInvalid(bdf(), 0, 0x3000))
        );
        assert_eq!(
            PhysicalDevice::new(
                bdf(),
                vec![PhysicalBar::new(0, 0x1, 0, BarKind::Mem64High)]
            ),
            Err(Error::DanglingHighHalf(bdf(), 0))
        );
    }
}
