// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! PCI base address register (BAR) virtualization for passthrough devices.
//!
//! pBAR: BAR of the physical device. Its value (a host physical address)
//! is assigned by platform firmware and is never changed by the hypervisor.
//!
//! vBAR: guest visible counterpart of a pBAR. It is initialized at attach
//! time from the static configuration of the device; a guest may then
//! reprogram it like it would a real BAR. The guest only ever sees vBARs.
//!
//! Guest writes to a memory vBAR are trapped to keep the second level
//! translation `vBAR (GPA) -> pBAR (HPA)` in sync with the register.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_device::{GuestMemoryMapper, MappingError, MappingFlags, VmId};
use vm_memory::GuestAddress;

use crate::bar::{
    compose_base, encode_into_register, mask_base, round_up_to_page, BarKind, BAR_SIZING_PATTERN,
};
use crate::configuration::{
    bar_index, PciConfigAccess, PCI_COMMAND_INTX_DISABLE, PCI_COMMAND_OFFSET,
};
use crate::device::PhysicalDevice;
use crate::PciBdf;

#[derive(Debug, Error)]
pub enum PassthroughError {
    #[error("Failed to unmap BAR {0} from 0x{1:x}: {2}")]
    UnmapBar(usize, u64, #[source] MappingError),
    #[error("Failed to map BAR {0} at 0x{1:x} onto 0x{2:x}: {3}")]
    MapBar(usize, u64, u64, #[source] MappingError),
}

/// Static configuration of a device passed through to a VM.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PassthroughConfig {
    pub bdf: PciBdf,
    /// Preassigned guest physical base address, one per BAR slot. For a
    /// 64-bit BAR the full base is given at the index of its lower half.
    #[serde(default)]
    pub vbar_base: Vec<u64>,
}

impl PassthroughConfig {
    pub fn new(bdf: PciBdf, vbar_base: Vec<u64>) -> Self {
        PassthroughConfig { bdf, vbar_base }
    }

    /// Preassigned base of slot `idx`, 0 (unassigned) when not configured.
    pub fn vbar_base(&self, idx: usize) -> u64 {
        self.vbar_base.get(idx).copied().unwrap_or(0)
    }
}

/// Guest visible state of one BAR register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VirtualBar {
    raw: u32,
    size: u64,
    kind: BarKind,
    mapped: Option<GuestAddress>,
}

impl VirtualBar {
    /// Register value as read by the guest.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Size in bytes, page granular. Always 0 unless the slot owns a mapping.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> BarKind {
        self.kind
    }

    pub fn is_high_half(&self) -> bool {
        self.kind.is_high_half()
    }

    /// Guest physical address currently mapped onto the physical BAR.
    pub fn mapped_gpa(&self) -> Option<GuestAddress> {
        self.mapped
    }
}

/// A physical device assigned to a VM, as seen by that VM.
///
/// The VM is referred to by its identifier; the caller hands over the VM's
/// translation on every call that may remap a BAR. The BAR table must be
/// accessed under mutual exclusion, which `&mut self` enforces.
pub struct PassthroughDevice {
    vm: VmId,
    pdev: Arc<PhysicalDevice>,
    config: PassthroughConfig,
    bars: Vec<VirtualBar>,
}

impl PassthroughDevice {
    /// Attaches `pdev` to `vm`.
    ///
    /// Every vBAR is initialized from the static configuration through the
    /// same path as guest writes, which installs the initial mappings. INTx
    /// is then disabled on the physical device: the guest receives the
    /// device interrupts through message signaled interrupts only.
    pub fn attach(
        vm: VmId,
        pdev: Arc<PhysicalDevice>,
        config: PassthroughConfig,
        mapper: &dyn GuestMemoryMapper,
        host: &dyn PciConfigAccess,
    ) -> Self {
        debug_assert!(pdev.bar_count() > 0, "device {} has no BAR", pdev.bdf());

        let bars = pdev
            .bars()
            .iter()
            .map(|pbar| VirtualBar {
                // Keep the flag bits only, the physical base must not leak
                // to the guest.
                raw: pbar.raw() & !pbar.kind().addr_mask(),
                size: 0,
                kind: pbar.kind(),
                mapped: None,
            })
            .collect();

        let mut device = PassthroughDevice {
            vm,
            pdev,
            config,
            bars,
        };

        for idx in 0..device.bars.len() {
            match device.bars[idx].kind {
                BarKind::Mem64High => {
                    let base = if idx > 0 {
                        device.config.vbar_base(idx - 1)
                    } else {
                        0
                    };
                    device.write_bar(idx, (base >> 32) as u32, mapper);
                }
                kind @ (BarKind::Mem32 | BarKind::Mem64Low) => {
                    let base = device.config.vbar_base(idx);
                    device.bars[idx].size = round_up_to_page(device.pdev.bar(idx).size());
                    if kind == BarKind::Mem64Low {
                        // Seed the upper half first so that the lower half
                        // write maps the full 64-bit base.
                        device.bars[idx + 1].raw = (base >> 32) as u32;
                    }
                    device.write_bar(idx, base as u32, mapper);
                }
                BarKind::Io => {
                    let base = device.config.vbar_base(idx) as u32;
                    let bar = &mut device.bars[idx];
                    bar.raw = encode_into_register(bar.raw, base, BarKind::Io);
                }
                BarKind::None => {}
            }
        }

        let bdf = device.pdev.bdf();
        let command = host.read_config_word(bdf, PCI_COMMAND_OFFSET);
        let command = command | PCI_COMMAND_INTX_DISABLE;
        host.write_config_word(bdf, PCI_COMMAND_OFFSET, command);
        debug!("{}: INTx disabled, command 0x{:x}", bdf, command);

        info!("{}: attached to {}", bdf, vm);

        device
    }

    /// Removes every guest mapping of the device. Called when the device is
    /// detached from its VM, or when the VM is destroyed.
    pub fn detach(&mut self, mapper: &dyn GuestMemoryMapper) {
        let bdf = self.pdev.bdf();

        for idx in 0..self.bars.len() {
            if let Err(e) = self.unmap_bar(idx, mapper) {
                error!("{}: {}", bdf, e);
            }
        }

        info!("{}: detached from {}", bdf, self.vm);
    }

    pub fn vm(&self) -> VmId {
        self.vm
    }

    pub fn bdf(&self) -> PciBdf {
        self.pdev.bdf()
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.pdev
    }

    pub fn config(&self) -> &PassthroughConfig {
        &self.config
    }

    pub fn bars(&self) -> &[VirtualBar] {
        &self.bars
    }

    pub fn bar(&self, idx: usize) -> &VirtualBar {
        &self.bars[idx]
    }

    /// Guest physical base currently programmed in the vBAR owning slot
    /// `idx` (a 32-bit BAR or the lower half of a 64-bit one).
    pub fn virtual_base(&self, idx: usize) -> u64 {
        let bar = &self.bars[idx];

        match bar.kind {
            BarKind::Mem32 => compose_base(bar.raw, 0, bar.size),
            BarKind::Mem64Low => compose_base(bar.raw, self.bars[idx + 1].raw, bar.size),
            _ => 0,
        }
    }

    /// Guest read of the BAR window.
    ///
    /// Only aligned dword accesses are supported, anything else reads as all
    /// ones.
    pub fn read_config(&self, offset: u32, width: usize) -> u32 {
        if width != 4 || offset & 0x3 != 0 {
            debug!(
                "{}: dropping BAR read at 0x{:x}, width {}",
                self.pdev.bdf(),
                offset,
                width
            );
            return 0xffff_ffff;
        }

        let Some(idx) = bar_index(offset) else {
            debug_assert!(false, "offset 0x{offset:x} outside of the BAR window");
            return 0xffff_ffff;
        };

        // BAR registers the device does not implement read as zero.
        self.bars.get(idx).map(|bar| bar.raw).unwrap_or(0)
    }

    /// Guest write of the BAR window.
    ///
    /// Only aligned dword accesses are supported, anything else is silently
    /// dropped.
    pub fn write_config(
        &mut self,
        offset: u32,
        width: usize,
        value: u32,
        mapper: &dyn GuestMemoryMapper,
    ) {
        if width != 4 || offset & 0x3 != 0 {
            debug!(
                "{}: dropping BAR write at 0x{:x}, width {}",
                self.pdev.bdf(),
                offset,
                width
            );
            return;
        }

        let Some(idx) = bar_index(offset) else {
            debug_assert!(false, "offset 0x{offset:x} outside of the BAR window");
            return;
        };

        if idx < self.bars.len() {
            self.write_bar(idx, value, mapper);
        }
    }

    fn write_bar(&mut self, idx: usize, value: u32, mapper: &dyn GuestMemoryMapper) {
        let sizing = value == BAR_SIZING_PATTERN;

        // The slot whose mapping is affected by this write.
        let owner = match self.bars[idx].kind {
            BarKind::Mem64High => {
                debug_assert!(idx > 0, "upper half of a 64-bit BAR at index 0");
                let low = idx - 1;
                let base = mask_base(self.bars[low].size, u64::from(value) << 32) >> 32;
                let bar = &mut self.bars[idx];
                bar.raw = encode_into_register(bar.raw, base as u32, BarKind::Mem64High);
                low
            }
            kind @ (BarKind::Mem32 | BarKind::Mem64Low) => {
                let bar = &mut self.bars[idx];
                let base = mask_base(bar.size, u64::from(value));
                bar.raw = encode_into_register(bar.raw, base as u32, kind);
                idx
            }
            // I/O BARs are not relocatable by the guest.
            BarKind::Io | BarKind::None => return,
        };

        if sizing {
            return;
        }

        if let Err(e) = self.remap_bar(owner, mapper) {
            error!("{}: {}", self.pdev.bdf(), e);
        }
    }

    // Removes the mapping recorded for slot `idx`. Another device of the
    // VM may have been programmed over it since, in which case the range
    // belongs to that device and only the bookkeeping is cleared.
    fn unmap_bar(
        &mut self,
        idx: usize,
        mapper: &dyn GuestMemoryMapper,
    ) -> Result<(), PassthroughError> {
        let bdf = self.pdev.bdf();
        let bar = self.bars[idx];
        let Some(gpa) = bar.mapped else {
            return Ok(());
        };

        if mapper.translate(gpa) == Some(self.pdev.bar_base(idx)) {
            mapper
                .remove_mapping(gpa, bar.size)
                .map_err(|e| PassthroughError::UnmapBar(idx, gpa.0, e))?;
            debug!("{}: BAR {} unmapped from 0x{:x}", bdf, idx, gpa.0);
        } else {
            debug!("{}: BAR {} no longer mapped at 0x{:x}", bdf, idx, gpa.0);
        }

        self.bars[idx].mapped = None;

        Ok(())
    }

    // Brings the translation of slot `idx` in line with its vBAR. The old
    // mapping is always removed before the new one is installed.
    fn remap_bar(
        &mut self,
        idx: usize,
        mapper: &dyn GuestMemoryMapper,
    ) -> Result<(), PassthroughError> {
        let bdf = self.pdev.bdf();
        let size = self.bars[idx].size;

        self.unmap_bar(idx, mapper)?;

        let vbar_base = self.virtual_base(idx);
        if vbar_base == 0 || size == 0 {
            return Ok(());
        }

        let gpa = GuestAddress(vbar_base);
        let pbar_base = self.pdev.bar_base(idx);

        match mapper.translate(gpa) {
            Some(hpa) if hpa == pbar_base => {
                debug!("{}: BAR {} already mapped at 0x{:x}", bdf, idx, vbar_base);
            }
            current => {
                if current.is_some() {
                    // Whatever the guest had at this address goes away.
                    mapper
                        .remove_mapping(gpa, size)
                        .map_err(|e| PassthroughError::UnmapBar(idx, vbar_base, e))?;
                }

                mapper
                    .add_mapping(gpa, pbar_base, size, MappingFlags::MMIO)
                    .map_err(|e| PassthroughError::MapBar(idx, vbar_base, pbar_base, e))?;
                debug!(
                    "{}: BAR {} mapped at 0x{:x} onto 0x{:x}, size 0x{:x}",
                    bdf, idx, vbar_base, pbar_base, size
                );
            }
        }

        self.bars[idx].mapped = Some(gpa);

        Ok(())
    }
}
