// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Second level translation of a VM, kept as a sorted set of regions.

use std::collections::BTreeMap;
use std::sync::Mutex;

use pci::PAGE_SIZE;
use vm_device::{GuestMemoryMapper, MappingError, MappingFlags, Result};
use vm_memory::{Address, GuestAddress, GuestUsize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub gpa: GuestAddress,
    pub hpa: u64,
    pub size: GuestUsize,
    pub flags: MappingFlags,
}

impl Mapping {
    // Address of the last byte, the region never wraps.
    fn last(&self) -> u64 {
        self.gpa.raw_value() + (self.size - 1)
    }

    fn contains(&self, gpa: GuestAddress) -> bool {
        gpa >= self.gpa && gpa.raw_value() <= self.last()
    }
}

/// Translation table of one VM, page granular.
#[derive(Debug, Default)]
pub struct GuestMappings {
    regions: Mutex<BTreeMap<GuestAddress, Mapping>>,
}

impl GuestMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active regions, sorted by guest physical address.
    pub fn snapshot(&self) -> Vec<Mapping> {
        self.regions.lock().unwrap().values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.lock().unwrap().is_empty()
    }

    // Returns the inclusive end of [gpa, gpa + size).
    fn check_range(gpa: GuestAddress, size: GuestUsize) -> Result<GuestAddress> {
        if size == 0 {
            return Err(MappingError::EmptyRange(gpa.raw_value()));
        }
        if gpa.raw_value() % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned(gpa.raw_value(), size));
        }

        gpa.checked_add(size - 1)
            .ok_or(MappingError::Overflow(gpa.raw_value(), size))
    }
}

impl GuestMemoryMapper for GuestMappings {
    fn add_mapping(
        &self,
        gpa: GuestAddress,
        hpa: u64,
        size: GuestUsize,
        flags: MappingFlags,
    ) -> Result<()> {
        let last = Self::check_range(gpa, size)?;
        if hpa % PAGE_SIZE != 0 {
            return Err(MappingError::Unaligned(hpa, size));
        }

        let mut regions = self.regions.lock().unwrap();

        // Regions do not overlap, so only the last one starting at or before
        // the end of the new range can reach into it.
        if let Some((_, region)) = regions.range(..=last).next_back() {
            if region.last() >= gpa.raw_value() {
                return Err(MappingError::Overlap(gpa.raw_value(), size));
            }
        }

        regions.insert(
            gpa,
            Mapping {
                gpa,
                hpa,
                size,
                flags,
            },
        );

        Ok(())
    }

    fn remove_mapping(&self, gpa: GuestAddress, size: GuestUsize) -> Result<()> {
        let last = Self::check_range(gpa, size)?;

        let mut regions = self.regions.lock().unwrap();

        let overlapping: Vec<Mapping> = regions
            .range(..=last)
            .rev()
            .map(|(_, region)| *region)
            .take_while(|region| region.last() >= gpa.raw_value())
            .collect();

        for region in overlapping {
            regions.remove(&region.gpa);

            // Keep whatever lies outside of the removed range.
            if region.gpa < gpa {
                let head = gpa.unchecked_offset_from(region.gpa);
                regions.insert(
                    region.gpa,
                    Mapping {
                        size: head,
                        ..region
                    },
                );
            }
            if region.last() > last.raw_value() {
                let start = last.unchecked_add(1);
                let offset = start.unchecked_offset_from(region.gpa);
                regions.insert(
                    start,
                    Mapping {
                        gpa: start,
                        hpa: region.hpa + offset,
                        size: region.size - offset,
                        flags: region.flags,
                    },
                );
            }
        }

        Ok(())
    }

    fn translate(&self, gpa: GuestAddress) -> Option<u64> {
        let regions = self.regions.lock().unwrap();
        let (_, region) = regions.range(..=gpa).next_back()?;

        region
            .contains(gpa)
            .then(|| region.hpa + gpa.unchecked_offset_from(region.gpa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_translate() {
        let mappings = GuestMappings::new();
        mappings
            .add_mapping(GuestAddress(0x8000_0000), 0xf000_0000, 0x2000, MappingFlags::MMIO)
            .unwrap();

        assert_eq!(mappings.translate(GuestAddress(0x8000_0000)), Some(0xf000_0000));
        assert_eq!(mappings.translate(GuestAddress(0x8000_1ffc)), Some(0xf000_1ffc));
        assert_eq!(mappings.translate(GuestAddress(0x8000_2000)), None);
        assert_eq!(mappings.translate(GuestAddress(0x7fff_ffff)), None);

        let snapshot = mappings.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].flags, MappingFlags::MMIO);
    }

    #[test]
    fn add_invalid_ranges() {
        let mappings = GuestMappings::new();
        mappings
            .add_mapping(GuestAddress(0x8000_0000), 0xf000_0000, 0x2000, MappingFlags::MMIO)
            .unwrap();

        assert_eq!(
            mappings.add_mapping(
                GuestAddress(0x8000_1000),
                0xe000_0000,
                0x1000,
                MappingFlags::MMIO,
            ),
            Err(MappingError::Overlap(0x8000_1000, 0x1000))
        );
        assert_eq!(
            mappings.add_mapping(
                GuestAddress(0x7fff_f000),
                0xe000_0000,
                0x2000,
                MappingFlags::MMIO,
            ),
            Err(MappingError::Overlap(0x7fff_f000, 0x2000))
        );
        assert_eq!(
            mappings.add_mapping(GuestAddress(0x9000_0000), 0xe000_0000, 0, MappingFlags::MMIO),
            Err(MappingError::EmptyRange(0x9000_0000))
        );
        assert_eq!(
            mappings.add_mapping(
                GuestAddress(0x9000_0100),
                0xe000_0000,
                0x1000,
                MappingFlags::MMIO,
            ),
            Err(MappingError::Unaligned(0x9000_0100, 0x1000))
        );
        assert_eq!(
            mappings.add_mapping(
                GuestAddress(0xffff_ffff_ffff_f000),
                0,
                0x2000,
                MappingFlags::MMIO,
            ),
            Err(MappingError::Overflow(0xffff_ffff_ffff_f000, 0x2000))
        );

        // Adjacent regions are fine.
        mappings
            .add_mapping(GuestAddress(0x8000_2000), 0xe000_0000, 0x1000, MappingFlags::READ)
            .unwrap();
        assert_eq!(mappings.snapshot().len(), 2);
    }

    #[test]
    fn remove_whole_region() {
        let mappings = GuestMappings::new();
        mappings
            .add_mapping(GuestAddress(0x8000_0000), 0xf000_0000, 0x2000, MappingFlags::MMIO)
            .unwrap();

        mappings.remove_mapping(GuestAddress(0x8000_0000), 0x2000).unwrap();
        assert!(mappings.is_empty());
        assert_eq!(mappings.translate(GuestAddress(0x8000_0000)), None);

        // Nothing left to remove.
        mappings.remove_mapping(GuestAddress(0x8000_0000), 0x2000).unwrap();
    }

    #[test]
    fn remove_splits_regions() {
        let mappings = GuestMappings::new();
        mappings
            .add_mapping(GuestAddress(0x1_0000), 0x10_0000, 0x4000, MappingFlags::MMIO)
            .unwrap();
        mappings
            .add_mapping(GuestAddress(0x1_4000), 0x20_0000, 0x2000, MappingFlags::MMIO)
            .unwrap();

        mappings.remove_mapping(GuestAddress(0x1_1000), 0x4000).unwrap();

        let snapshot = mappings.snapshot();
        assert_eq!(
            snapshot
                .iter()
                .map(|m| (m.gpa.raw_value(), m.hpa, m.size))
                .collect::<Vec<_>>(),
            vec![(0x1_0000, 0x10_0000, 0x1000), (0x1_5000, 0x20_1000, 0x1000)]
        );
        assert_eq!(mappings.translate(GuestAddress(0x1_3000)), None);
        assert_eq!(mappings.translate(GuestAddress(0x1_5004)), Some(0x20_1004));
    }
}
