// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::command::common::{
    ResponseCode, ScsiStatus, TaskAttribute, UnknownResponseCode, UnknownScsiStatus,
};

/// 3-bit SCSI Task Attribute (lower bits of the request flags).
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawTaskAttribute(u8);

impl RawTaskAttribute {
    const MASK: u8 = 0b0000_0111;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0 & Self::MASK
    }

    #[inline]
    pub const fn new(bits3: u8) -> Self {
        Self(bits3 & Self::MASK)
    }

    #[inline]
    pub fn decode(&self) -> TaskAttribute {
        match self.raw() {
            0 => TaskAttribute::Untagged,
            1 => TaskAttribute::Simple,
            2 => TaskAttribute::Ordered,
            3 => TaskAttribute::HeadOfQueue,
            4 => TaskAttribute::ACA,
            r => TaskAttribute::Reserved(r),
        }
    }
}

impl fmt::Debug for RawTaskAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawTaskAttribute({:?})", self.decode())
    }
}

/// Wire view for **SCSI Command Request** flags (byte 1 of the PDU).
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiCmdReqFlags(u8);

impl RawScsiCmdReqFlags {
    pub const ATTR: u8 = 0x07;
    pub const FINAL: u8 = 0x80;
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;

    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.0 & Self::FINAL != 0
    }

    #[inline]
    pub fn read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    #[inline]
    pub fn write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    #[inline]
    pub fn set_fin(&mut self, on: bool) {
        self.set(Self::FINAL, on)
    }

    #[inline]
    pub fn set_read(&mut self, on: bool) {
        self.set(Self::READ, on)
    }

    #[inline]
    pub fn set_write(&mut self, on: bool) {
        self.set(Self::WRITE, on)
    }

    #[inline]
    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    #[inline]
    pub fn task_attr(&self) -> TaskAttribute {
        RawTaskAttribute::new(self.0 & Self::ATTR).decode()
    }
}

impl fmt::Debug for RawScsiCmdReqFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.fin() {
            parts.push("F".to_string());
        }
        if self.read() {
            parts.push("R".to_string());
        }
        if self.write() {
            parts.push("W".to_string());
        }
        parts.push(format!("{:?}", self.task_attr()));
        write!(f, "RawScsiCmdReqFlags({})", parts.join("|"))
    }
}

/// Wire view for **SCSI Command Response** flags (byte 1 of the PDU).
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiCmdRespFlags(u8);

impl RawScsiCmdRespFlags {
    pub const FINAL: u8 = 0b1000_0000;
    /// bidi read residual overflow
    pub const O_SMALL: u8 = 0b0001_0000;
    /// residual overflow
    pub const O_BIG: u8 = 0b0000_0100;
    /// bidi read residual underflow
    pub const U_SMALL: u8 = 0b0000_1000;
    /// residual underflow
    pub const U_BIG: u8 = 0b0000_0010;

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
    pub fn overflow(&self) -> bool {
        self.0 & Self::O_BIG != 0
    }

    #[inline]
    pub fn set_overflow(&mut self, on: bool) {
        self.set(Self::O_BIG, on)
    }

    #[inline]
    pub fn underflow(&self) -> bool {
        self.0 & Self::U_BIG != 0
    }

    #[inline]
    pub fn set_underflow(&mut self, on: bool) {
        self.set(Self::U_BIG, on)
    }

    #[inline]
    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl fmt::Debug for RawScsiCmdRespFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.fin() {
            parts.push("F");
        }
        if self.overflow() {
            parts.push("O");
        }
        if self.underflow() {
            parts.push("U");
        }
        write!(f, "RawScsiCmdRespFlags({})", parts.join("|"))
    }
}

/// Wire view of a SCSI status byte.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawScsiStatus(u8);

impl RawScsiStatus {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> Result<ScsiStatus, UnknownScsiStatus> {
        ScsiStatus::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, st: ScsiStatus) {
        self.0 = st as u8;
    }
}

impl fmt::Debug for RawScsiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(st) => write!(f, "RawScsiStatus({st:?})"),
            Err(_) => write!(f, "RawScsiStatus(0x{:02x})", self.0),
        }
    }
}

/// Wire view of the iSCSI response byte of a SCSI Response PDU.
#[repr(transparent)]
#[derive(Default, Clone, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawResponseCode(u8);

impl RawResponseCode {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub fn decode(&self) -> Result<ResponseCode, UnknownResponseCode> {
        ResponseCode::from_u8(self.0)
    }

    #[inline]
    pub fn encode(&mut self, rc: ResponseCode) {
        self.0 = rc as u8;
    }
}

impl fmt::Debug for RawResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(rc) => write!(f, "RawResponseCode({rc:?})"),
            Err(_) => write!(f, "RawResponseCode(0x{:02x})", self.0),
        }
    }
}
