// Copyright © 2019 Intel Corporation. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Second level address translation contract.

use bitflags::bitflags;
use thiserror::Error;
use vm_memory::{GuestAddress, GuestUsize};

bitflags! {
    /// Attributes of a guest physical to host physical mapping.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MappingFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Uncached memory type.
        const UNCACHED = 1 << 3;
        /// Device MMIO window exposed to a guest.
        const MMIO = Self::READ.bits() | Self::WRITE.bits() | Self::UNCACHED.bits();
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("Mapping of zero bytes at 0x{0:x}")]
    EmptyRange(u64),
    #[error("Address 0x{0:x} or size 0x{1:x} is not page aligned")]
    Unaligned(u64, u64),
    #[error("Range at 0x{0:x} of size 0x{1:x} overflows the address space")]
    Overflow(u64, u64),
    #[error("Range at 0x{0:x} of size 0x{1:x} overlaps an existing mapping")]
    Overlap(u64, u64),
}

pub type Result<T> = std::result::Result<T, MappingError>;

/// Second level address translation of one virtual machine.
///
/// Several passthrough devices assigned to the same VM may update their
/// BARs concurrently, so implementations must serialize `add_mapping` and
/// `remove_mapping` internally.
pub trait GuestMemoryMapper: Send + Sync {
    /// Maps `[gpa, gpa + size)` onto the host physical range starting at `hpa`.
    fn add_mapping(
        &self,
        gpa: GuestAddress,
        hpa: u64,
        size: GuestUsize,
        flags: MappingFlags,
    ) -> Result<()>;

    /// Unmaps every page of `[gpa, gpa + size)`. Pages that are not mapped
    /// are skipped.
    fn remove_mapping(&self, gpa: GuestAddress, size: GuestUsize) -> Result<()>;

    /// Returns the host physical address backing `gpa`, or `None` when the
    /// address is not mapped.
    fn translate(&self, gpa: GuestAddress) -> Option<u64>;
}
