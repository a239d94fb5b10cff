// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use anyhow::{Result, bail};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Flags byte of a Data-Out PDU: only the F bit is defined.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDataOutFlags(u8);

impl RawDataOutFlags {
    const FINAL: u8 = 0x80;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & Self::FINAL != 0
    }

    #[inline]
    pub fn set_fin(&mut self, on: bool) {
        if on {
            self.0 |= Self::FINAL;
        } else {
            self.0 &= !Self::FINAL;
        }
    }
}

impl fmt::Debug for RawDataOutFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawDataOutFlags(F={})", self.fin())
    }
}

/// Flags byte of a Data-In PDU: `F,A,0,0,0,O,U,S`.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawDataInFlags(u8);

impl RawDataInFlags {
    const ACK: u8 = 0x40;
    const FINAL: u8 = 0x80;
    const OVERFLOW: u8 = 0x04;
    const RESERVED: u8 = 0x38;
    const STATUS: u8 = 0x01;
    const UNDERFLOW: u8 = 0x02;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & Self::FINAL != 0
    }

    #[inline]
    pub fn set_fin(&mut self, on: bool) {
        self.set(Self::FINAL, on)
    }

    #[inline]
    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    #[inline]
    pub fn s(&self) -> bool {
        self.0 & Self::STATUS != 0
    }

    #[inline]
    pub fn set_s(&mut self, on: bool) {
        self.set(Self::STATUS, on)
    }

    #[inline]
    pub fn overflow(&self) -> bool {
        self.0 & Self::OVERFLOW != 0
    }

    #[inline]
    pub fn underflow(&self) -> bool {
        self.0 & Self::UNDERFLOW != 0
    }

    #[inline]
    pub fn set_underflow(&mut self, on: bool) {
        self.set(Self::UNDERFLOW, on)
    }

    #[inline]
    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Reserved bits clear, O/U mutually exclusive, S implies F.
    pub fn validate(&self) -> Result<()> {
        if self.0 & Self::RESERVED != 0 {
            bail!("DataIn flags: reserved bits set: {:#010b}", self.0);
        }
        if self.overflow() && self.underflow() {
            bail!("DataIn flags: O and U both set");
        }
        if self.s() && !self.fin() {
            bail!("DataIn flags: S set without F");
        }
        Ok(())
    }
}

impl fmt::Debug for RawDataInFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.fin() {
            parts.push("F");
        }
        if self.ack() {
            parts.push("A");
        }
        if self.overflow() {
            parts.push("O");
        }
        if self.underflow() {
            parts.push("U");
        }
        if self.s() {
            parts.push("S");
        }
        write!(f, "RawDataInFlags({})", parts.join("|"))
    }
}
