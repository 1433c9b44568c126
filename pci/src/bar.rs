// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Encoding and decoding of Base Address Registers.
//!
//! A 32-bit BAR register is laid out as follows (see pci_regs.h in kernel):
//!
//! * I/O BAR: bit 0 set, bits 31:2 hold the base address.
//! * Memory BAR: bit 0 clear, bits 2:1 select the decoder width (00 for
//!   32-bit, 10 for 64-bit), bit 3 is the prefetchable flag and bits 31:4
//!   hold the base address.
//!
//! A 64-bit memory BAR spans two consecutive registers, the second one
//! holding address bits 63:32 without any flag bits.

use serde::{Deserialize, Serialize};

/// I/O space indicator, bit 0 of the register.
pub const BAR_IO_SPACE: u32 = 0x1;
/// Memory decoder width, bits 2:1 of a memory BAR.
pub const BAR_MEM_TYPE_MASK: u32 = 0x6;
pub const BAR_MEM_TYPE_32BIT: u32 = 0x0;
pub const BAR_MEM_TYPE_64BIT: u32 = 0x4;
pub const BAR_IO_ADDR_MASK: u32 = 0xffff_fffc;
pub const BAR_MEM_ADDR_MASK: u32 = 0xffff_fff0;
/// Value written by software to discover the size of a BAR.
pub const BAR_SIZING_PATTERN: u32 = 0xffff_ffff;

pub const PAGE_SIZE: u64 = 0x1000;

/// The role a BAR register plays in the device's BAR table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BarKind {
    /// Unimplemented register.
    #[default]
    None,
    Io,
    Mem32,
    /// Lower register of a 64-bit memory BAR, carries the flag bits.
    Mem64Low,
    /// Upper register of a 64-bit memory BAR, bits 63:32 of the base.
    Mem64High,
}

impl BarKind {
    pub fn is_memory(self) -> bool {
        matches!(self, BarKind::Mem32 | BarKind::Mem64Low | BarKind::Mem64High)
    }

    pub fn is_high_half(self) -> bool {
        self == BarKind::Mem64High
    }

    /// Only 32-bit memory BARs and the lower half of 64-bit ones own a size
    /// and a guest mapping.
    pub fn owns_mapping(self) -> bool {
        matches!(self, BarKind::Mem32 | BarKind::Mem64Low)
    }

    /// Mask selecting the base address bits of a register of this kind.
    pub fn addr_mask(self) -> u32 {
        match self {
            BarKind::None => 0,
            BarKind::Io => BAR_IO_ADDR_MASK,
            BarKind::Mem32 | BarKind::Mem64Low => BAR_MEM_ADDR_MASK,
            BarKind::Mem64High => 0xffff_ffff,
        }
    }
}

/// Decodes the kind of a BAR from its register value.
///
/// The upper half of a 64-bit BAR cannot be recognized from its own value,
/// it is identified by its position after a `Mem64Low` register.
pub fn decode_kind(raw: u32) -> BarKind {
    if raw & BAR_IO_SPACE != 0 {
        return BarKind::Io;
    }

    match raw & BAR_MEM_TYPE_MASK {
        BAR_MEM_TYPE_32BIT => BarKind::Mem32,
        BAR_MEM_TYPE_64BIT => BarKind::Mem64Low,
        // 01b was "below 1MiB" in PCI 2.x, 11b is reserved.
        _ => BarKind::None,
    }
}

fn alignment_mask(size: u64) -> u64 {
    if size == 0 {
        return u64::MAX;
    }

    debug_assert!(size.is_power_of_two(), "BAR size 0x{size:x} not a power of two");
    !(size - 1)
}

/// Clears the bits of `value` below the BAR alignment boundary `size`.
///
/// Writing `BAR_SIZING_PATTERN` yields the mask software reads back to compute
/// the BAR size.
pub fn mask_base(size: u64, value: u64) -> u64 {
    value & alignment_mask(size)
}

/// Full base address of a memory BAR, from its lower register and, for
/// 64-bit BARs, its upper register (`0` for 32-bit BARs).
pub fn compose_base(low_raw: u32, high_raw: u32, size: u64) -> u64 {
    let base = (u64::from(high_raw) << 32) | u64::from(low_raw & BAR_MEM_ADDR_MASK);
    base & alignment_mask(size)
}

/// Replaces the base address bits of `old_raw` with the ones of `base`,
/// leaving the flag bits untouched.
pub fn encode_into_register(old_raw: u32, base: u32, kind: BarKind) -> u32 {
    let mask = kind.addr_mask();
    (old_raw & !mask) | (base & mask)
}

/// Virtual BAR sizes are page granular so that the guest places them on
/// page boundaries the second level translation can map.
pub fn round_up_to_page(size: u64) -> u64 {
    size.next_multiple_of(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_bar_kinds() {
        assert_eq!(decode_kind(0xf000_0000), BarKind::Mem32);
        assert_eq!(decode_kind(0xf000_0008), BarKind::Mem32);
        assert_eq!(decode_kind(0xf000_0004), BarKind::Mem64Low);
        assert_eq!(decode_kind(0xf000_000c), BarKind::Mem64Low);
        assert_eq!(decode_kind(0x0000_e001), BarKind::Io);
        assert_eq!(decode_kind(0x0000_0002), BarKind::None);
        assert_eq!(decode_kind(0x0000_0006), BarKind::None);
    }

    #[test]
    fn sizing_readback() {
        assert_eq!(mask_base(0x2000, u64::from(BAR_SIZING_PATTERN)), 0xffff_e000);
        assert_eq!(mask_base(0x1000, u64::from(BAR_SIZING_PATTERN)), 0xffff_f000);

        // Upper half of a 64-bit BAR smaller than 4GiB reads back all ones.
        let high = mask_base(0x10_0000, u64::from(BAR_SIZING_PATTERN) << 32) >> 32;
        assert_eq!(high, 0xffff_ffff);

        // Upper half of an 8GiB BAR has its lowest bit cleared.
        let high = mask_base(0x2_0000_0000, u64::from(BAR_SIZING_PATTERN) << 32) >> 32;
        assert_eq!(high, 0xffff_fffe);
    }

    #[test]
    fn mask_unaligned_base() {
        assert_eq!(mask_base(0x2000, 0x9000_1234), 0x9000_0000);
        assert_eq!(mask_base(0, 0x9000_1230), 0x9000_1230);
    }

    #[test]
    fn encode_preserves_flags() {
        // 64-bit prefetchable memory BAR.
        let raw = encode_into_register(0x0000_000c, 0x8000_0000, BarKind::Mem64Low);
        assert_eq!(raw, 0x8000_000c);
        let raw = encode_into_register(raw, 0xffff_e000, BarKind::Mem64Low);
        assert_eq!(raw, 0xffff_e00c);

        let raw = encode_into_register(0x0000_0001, 0x0000_e000, BarKind::Io);
        assert_eq!(raw, 0x0000_e001);

        assert_eq!(
            encode_into_register(0x1234_5678, 0x0000_0001, BarKind::Mem64High),
            0x0000_0001
        );
        assert_eq!(
            encode_into_register(0x0000_0000, 0xffff_ffff, BarKind::None),
            0x0000_0000
        );
    }

    #[test]
    fn compose_bases() {
        assert_eq!(compose_base(0xf000_0004, 0, 0x2000), 0xf000_0000);
        assert_eq!(compose_base(0x8000_000c, 0x1, 0x10_0000), 0x1_8000_0000);
        assert_eq!(compose_base(0xffff_e00c, 0xffff_ffff, 0x2000), 0xffff_ffff_ffff_e000);
    }

    #[test]
    fn round_to_page() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(0x100), PAGE_SIZE);
        assert_eq!(round_up_to_page(0x1000), 0x1000);
        assert_eq!(round_up_to_page(0x2000), 0x2000);
    }
}
