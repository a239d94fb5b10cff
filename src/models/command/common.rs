// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use thiserror::Error;

/// SCSI task attributes carried in the low bits of the command flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TaskAttribute {
    #[default]
    Untagged,
    Simple,
    Ordered,
    HeadOfQueue,
    ACA,
    Reserved(u8),
}

/// SCSI status codes a target returns (SAM-3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScsiStatus {
    #[default]
    Good = 0x00,
    CheckCondition = 0x02,
    Busy = 0x08,
    ReservationConflict = 0x18,
    TaskSetFull = 0x28,
    TaskAborted = 0x40,
}

#[derive(Debug, Error)]
#[error("unknown SCSI status: 0x{0:02x}")]
pub struct UnknownScsiStatus(pub u8);

impl ScsiStatus {
    pub fn from_u8(v: u8) -> Result<Self, UnknownScsiStatus> {
        Ok(match v {
            0x00 => ScsiStatus::Good,
            0x02 => ScsiStatus::CheckCondition,
            0x08 => ScsiStatus::Busy,
            0x18 => ScsiStatus::ReservationConflict,
            0x28 => ScsiStatus::TaskSetFull,
            0x40 => ScsiStatus::TaskAborted,
            other => return Err(UnknownScsiStatus(other)),
        })
    }
}

/// iSCSI response field of a SCSI Response PDU: command completed at target,
/// or target failure.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    #[default]
    CommandCompleted = 0x00,
    TargetFailure = 0x01,
}

#[derive(Debug, Error)]
#[error("unknown iSCSI response code: 0x{0:02x}")]
pub struct UnknownResponseCode(pub u8);

impl ResponseCode {
    pub fn from_u8(v: u8) -> Result<Self, UnknownResponseCode> {
        Ok(match v {
            0x00 => ResponseCode::CommandCompleted,
            0x01 => ResponseCode::TargetFailure,
            other => return Err(UnknownResponseCode(other)),
        })
    }
}
