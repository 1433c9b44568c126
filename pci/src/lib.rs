// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Implements BAR virtualization for PCI devices passed through to guests.
#[macro_use]
extern crate log;

mod bar;
mod configuration;
mod device;
mod passthrough;

use std::fmt::{self, Debug, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::de::Visitor;
use thiserror::Error;

pub use self::bar::{
    compose_base, decode_kind, encode_into_register, mask_base, round_up_to_page, BarKind,
    BAR_IO_ADDR_MASK, BAR_MEM_ADDR_MASK, BAR_SIZING_PATTERN, PAGE_SIZE,
};
pub use self::configuration::{
    bar_index, bar_offset, is_bar_offset, PciConfigAccess, NUM_BAR_REGS, PCI_COMMAND_INTX_DISABLE,
    PCI_COMMAND_OFFSET, PCI_CONFIG_BAR_END, PCI_CONFIG_BAR_OFFSET, PCI_CONFIG_SPACE_SIZE,
};
pub use self::device::{Error as PciDeviceError, PhysicalBar, PhysicalDevice};
pub use self::passthrough::{PassthroughConfig, PassthroughDevice, PassthroughError, VirtualBar};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciBdf(u32);

#[derive(Debug, Error)]
pub enum PciBdfParseError {
    #[error("Invalid PCI address format: {0}")]
    InvalidFormat(String),
    #[error("Invalid PCI address component: {0}")]
    InvalidNumber(#[source] ParseIntError),
    #[error("PCI device number 0x{0:x} is out of range")]
    DeviceOutOfRange(u8),
    #[error("PCI function number 0x{0:x} is out of range")]
    FunctionOutOfRange(u8),
}

struct PciBdfVisitor;

impl Visitor<'_> for PciBdfVisitor {
    type Value = PciBdf;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a PCI address formatted as [ssss:]bb:dd.f")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        v.parse().map_err(E::custom)
    }
}

impl<'de> serde::Deserialize<'de> for PciBdf {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PciBdfVisitor)
    }
}

impl serde::Serialize for PciBdf {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(&self.to_string())
    }
}

impl PciBdf {
    pub fn segment(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self(
            ((segment as u32) << 16)
                | ((bus as u32) << 8)
                | (((device & 0x1f) as u32) << 3)
                | (function & 0x7) as u32,
        )
    }
}

impl From<u32> for PciBdf {
    fn from(bdf: u32) -> Self {
        Self(bdf)
    }
}

impl From<PciBdf> for u32 {
    fn from(bdf: PciBdf) -> Self {
        bdf.0
    }
}

impl Debug for PciBdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for PciBdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

impl FromStr for PciBdf {
    type Err = PciBdfParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, function) = s
            .split_once('.')
            .ok_or_else(|| PciBdfParseError::InvalidFormat(s.to_string()))?;
        let function = u8::from_str_radix(function, 16).map_err(PciBdfParseError::InvalidNumber)?;

        // The segment may be omitted, in which case it defaults to 0.
        let items: Vec<&str> = address.split(':').collect();
        let (segment, bus, device) = match items.as_slice() {
            [segment, bus, device] => (
                u16::from_str_radix(segment, 16).map_err(PciBdfParseError::InvalidNumber)?,
                *bus,
                *device,
            ),
            [bus, device] => (0, *bus, *device),
            _ => return Err(PciBdfParseError::InvalidFormat(s.to_string())),
        };
        let bus = u8::from_str_radix(bus, 16).map_err(PciBdfParseError::InvalidNumber)?;
        let device = u8::from_str_radix(device, 16).map_err(PciBdfParseError::InvalidNumber)?;

        if device > 0x1f {
            return Err(PciBdfParseError::DeviceOutOfRange(device));
        }
        if function > 0x7 {
            return Err(PciBdfParseError::FunctionOutOfRange(function));
        }

        Ok(PciBdf::new(segment, bus, device, function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_from_str() {
        let bdf: PciBdf = "0001:02:1f.3".parse().unwrap();
        assert_eq!(bdf.segment(), 1);
        assert_eq!(bdf.bus(), 2);
        assert_eq!(bdf.device(), 0x1f);
        assert_eq!(bdf.function(), 3);
        assert_eq!(bdf.to_string(), "0001:02:1f.3");

        let short: PciBdf = "00:1f.0".parse().unwrap();
        assert_eq!(short, PciBdf::new(0, 0, 0x1f, 0));
    }

    #[test]
    fn bdf_from_str_invalid() {
        assert!("00:1f".parse::<PciBdf>().is_err());
        assert!("0:0:0:0.0".parse::<PciBdf>().is_err());
        assert!("00:20.0".parse::<PciBdf>().is_err());
        assert!("00:1f.8".parse::<PciBdf>().is_err());
        assert!("00:zz.0".parse::<PciBdf>().is_err());
    }

    #[test]
    fn bdf_serde() {
        let bdf: PciBdf = serde_json::from_str("\"0000:03:00.1\"").unwrap();
        assert_eq!(bdf, PciBdf::new(0, 3, 0, 1));
        assert_eq!(serde_json::to_string(&bdf).unwrap(), "\"0000:03:00.1\"");
        assert!(serde_json::from_str::<PciBdf>("\"bogus\"").is_err());
    }
}
