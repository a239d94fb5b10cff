// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Task management functions (RFC 3720 § 10.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LogicalUnitReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    TaskReassign = 8,
}

impl TaskFunction {
    pub fn from_u7(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::AbortTask,
            2 => Self::AbortTaskSet,
            3 => Self::ClearAca,
            4 => Self::ClearTaskSet,
            5 => Self::LogicalUnitReset,
            6 => Self::TargetWarmReset,
            7 => Self::TargetColdReset,
            8 => Self::TaskReassign,
            _ => return None,
        })
    }

    /// Functions that address a specific LUN carry a meaningful LUN field
    /// (RFC 3720 § 10.5.3).
    pub fn is_lun_scoped(self) -> bool {
        matches!(
            self,
            Self::AbortTask
                | Self::AbortTaskSet
                | Self::ClearAca
                | Self::ClearTaskSet
                | Self::LogicalUnitReset
        )
    }
}

/// Task management response codes (RFC 3720 § 10.6.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskResponseCode {
    #[default]
    FunctionComplete = 0,
    NoSuchTask = 1,
    NoSuchLun = 2,
    StillAllegiant = 3,
    NoFailover = 4,
    NoSupport = 5,
    AuthorizationFailed = 6,
    Rejected = 255,
}
