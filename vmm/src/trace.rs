// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Recorded guest accesses to the configuration space of assigned devices.

use pci::PciBdf;
use serde::{Deserialize, Serialize};
use vm_device::VmId;

use crate::passthrough_manager::PassthroughManager;
use crate::Result;

fn default_width() -> usize {
    4
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GuestAccess {
    Read {
        vm: VmId,
        bdf: PciBdf,
        offset: u32,
        #[serde(default = "default_width")]
        width: usize,
    },
    Write {
        vm: VmId,
        bdf: PciBdf,
        offset: u32,
        #[serde(default = "default_width")]
        width: usize,
        value: u32,
    },
}

/// Outcome of one replayed access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AccessRecord {
    pub access: GuestAccess,
    /// Value returned by a read, `None` for writes and for reads the BAR
    /// emulation does not handle.
    pub value: Option<u32>,
}

pub fn replay(manager: &PassthroughManager, trace: &[GuestAccess]) -> Result<Vec<AccessRecord>> {
    let mut records = Vec::with_capacity(trace.len());

    for access in trace.iter().copied() {
        let value = match access {
            GuestAccess::Read {
                vm,
                bdf,
                offset,
                width,
            } => {
                let value = manager.read_config(vm, bdf, offset, width)?;
                debug!(
                    "{} read {} at 0x{:x}, width {}: {:x?}",
                    vm, bdf, offset, width, value
                );
                value
            }
            GuestAccess::Write {
                vm,
                bdf,
                offset,
                width,
                value,
            } => {
                if !manager.write_config(vm, bdf, offset, width, value)? {
                    warn!(
                        "{} write to {} at 0x{:x} not handled by BAR emulation",
                        vm, bdf, offset
                    );
                }
                None
            }
        };

        records.push(AccessRecord { access, value });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trace() {
        let trace: Vec<GuestAccess> = serde_json::from_str(
            r#"[
                { "op": "write", "vm": 1, "bdf": "00:02.0", "offset": 16, "value": 4294967295 },
                { "op": "read", "vm": 1, "bdf": "00:02.0", "offset": 16 },
                { "op": "read", "vm": 1, "bdf": "00:02.0", "offset": 17, "width": 1 }
            ]"#,
        )
        .unwrap();

        assert_eq!(
            trace,
            vec![
                GuestAccess::Write {
                    vm: VmId(1),
                    bdf: PciBdf::new(0, 0, 2, 0),
                    offset: 0x10,
                    width: 4,
                    value: 0xffff_ffff,
                },
                GuestAccess::Read {
                    vm: VmId(1),
                    bdf: PciBdf::new(0, 0, 2, 0),
                    offset: 0x10,
                    width: 4,
                },
                GuestAccess::Read {
                    vm: VmId(1),
                    bdf: PciBdf::new(0, 0, 2, 0),
                    offset: 0x11,
                    width: 1,
                },
            ]
        );
        assert!(serde_json::from_str::<GuestAccess>(r#"{ "op": "poke" }"#).is_err());
    }
}
