// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Logical unit numbers and their 8-byte wire form.

use core::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};

/// Maximum number of LUNs a target presents.
pub const MAX_LUNS: u64 = 256;

/// Symbolic "no LUN" value, outside the valid range.
pub const LUN_NONE: u64 = MAX_LUNS + 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lun(u64);

impl Lun {
    pub fn new(value: u64) -> Result<Self> {
        if value >= MAX_LUNS {
            bail!("LUN {value} out of range (max {})", MAX_LUNS - 1);
        }
        Ok(Lun(value))
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Wire form: value in the first two bytes big-endian, rest zero.
    pub fn to_wire(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..2].copy_from_slice(&(self.0 as u16).to_be_bytes());
        buf
    }

    /// Parse the wire form; bytes 2..7 are ignored, as the original target
    /// stack never looked at them either.
    pub fn from_wire(buf: &[u8; 8]) -> Result<Self> {
        Lun::new(u16::from_be_bytes([buf[0], buf[1]]) as u64)
    }

    /// Raw 64-bit LUN field of a BHS, as a `Lun` when in range.
    pub fn from_bhs_field(raw: u64) -> Result<Self> {
        Lun::from_wire(&raw.to_be_bytes())
    }

    pub fn to_bhs_field(self) -> u64 {
        u64::from_be_bytes(self.to_wire())
    }
}

impl fmt::Display for Lun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Lun {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u64 = s
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid LUN {s:?}: {e}"))?;
        Lun::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lun_range_check() {
        assert!(Lun::new(0).is_ok());
        assert!(Lun::new(MAX_LUNS - 1).is_ok());
        assert!(Lun::new(MAX_LUNS).is_err());
        assert!(Lun::new(LUN_NONE).is_err());
    }

    #[test]
    fn lun_string_round_trip() {
        for v in [0u64, 1, 42, 255] {
            let lun = Lun::new(v).expect("valid");
            assert_eq!(lun.to_string().parse::<Lun>().expect("parse"), lun);
        }
        assert!("256".parse::<Lun>().is_err());
        assert!("-1".parse::<Lun>().is_err());
        assert!("x".parse::<Lun>().is_err());
    }

    #[test]
    fn lun_wire_form() {
        let lun = Lun::new(3).expect("valid");
        assert_eq!(lun.to_wire(), [0, 3, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Lun::from_wire(&lun.to_wire()).expect("parse"), lun);

        // trailing garbage is ignored by the parser
        let mut buf = lun.to_wire();
        buf[5] = 0xAB;
        assert_eq!(Lun::from_wire(&buf).expect("parse"), lun);
    }

    #[test]
    fn lun_bhs_field_round_trip() {
        let lun = Lun::new(255).expect("valid");
        assert_eq!(
            Lun::from_bhs_field(lun.to_bhs_field()).expect("parse"),
            lun
        );
    }
}
