// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Stable error codes surfaced to the admin layer.
//!
//! The numeric values are part of the management protocol: they cross the
//! admind RPC boundary and end up in CLI output, so they must never be
//! renumbered.

use core::fmt;

use thiserror::Error;

/// Errors returned by the export registry, the LUM executive and the
/// LUN-management entry points.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LumError {
    #[error("operation does not apply to this export method")]
    ExportWrongMethod = 100,
    #[error("export not found")]
    ExportNotFound = 101,
    #[error("volume is already exported")]
    VolumeAlreadyExported = 102,
    #[error("volume is not exported")]
    VolumeNotExported = 103,
    #[error("volume is in use")]
    VolumeIsInUse = 104,

    #[error("no LUN available")]
    NoLunAvailable = 110,
    #[error("invalid LUN value")]
    LunInvalidValue = 111,
    #[error("LUN is busy")]
    LunBusy = 112,
    #[error("LUN is already assigned")]
    LunAlreadyAssigned = 113,

    #[error("XML parse error")]
    XmlParse = 120,
    #[error("cannot read file")]
    ReadFile = 121,

    #[error("invalid parameter")]
    InvalidParam = 130,
    #[error("not found")]
    NotFound = 131,

    #[error("too many IQN filters")]
    TooManyIqnFilters = 140,
    #[error("duplicate IQN filter")]
    DuplicateIqnFilter = 141,
    #[error("IQN filter not found")]
    IqnFilterNotFound = 142,

    #[error("no space left in export table")]
    NoSpace = 150,

    #[error("peer node went down")]
    NodeDown = 160,
}

impl LumError {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`LumError::code`], for codes that crossed the wire.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            100 => Self::ExportWrongMethod,
            101 => Self::ExportNotFound,
            102 => Self::VolumeAlreadyExported,
            103 => Self::VolumeNotExported,
            104 => Self::VolumeIsInUse,
            110 => Self::NoLunAvailable,
            111 => Self::LunInvalidValue,
            112 => Self::LunBusy,
            113 => Self::LunAlreadyAssigned,
            120 => Self::XmlParse,
            121 => Self::ReadFile,
            130 => Self::InvalidParam,
            131 => Self::NotFound,
            140 => Self::TooManyIqnFilters,
            141 => Self::DuplicateIqnFilter,
            142 => Self::IqnFilterNotFound,
            150 => Self::NoSpace,
            160 => Self::NodeDown,
            _ => return None,
        })
    }
}

pub type LumResult<T> = Result<T, LumError>;

/// Aggregate outcome of a cluster barrier: `Success` on every node, or the
/// first non-success code reported by any participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierCode {
    #[default]
    Success,
    Failed(LumError),
}

impl BarrierCode {
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, BarrierCode::Success)
    }

    /// Fold a local return code into an aggregate, keeping the first failure.
    pub fn merge(self, other: BarrierCode) -> BarrierCode {
        match self {
            BarrierCode::Success => other,
            failed => failed,
        }
    }
}

impl From<Result<(), LumError>> for BarrierCode {
    fn from(r: Result<(), LumError>) -> Self {
        match r {
            Ok(()) => BarrierCode::Success,
            Err(e) => BarrierCode::Failed(e),
        }
    }
}

impl fmt::Display for BarrierCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarrierCode::Success => f.write_str("success"),
            BarrierCode::Failed(e) => write!(f, "{e} ({})", e.code()),
        }
    }
}
