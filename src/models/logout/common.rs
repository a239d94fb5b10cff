// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Logout reason codes (RFC 3720 § 10.14.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogoutReason {
    #[default]
    CloseSession = 0,
    CloseConnection = 1,
    RemoveConnectionForRecovery = 2,
}

impl LogoutReason {
    pub fn from_u7(v: u8) -> Option<Self> {
        match v {
            0 => Some(LogoutReason::CloseSession),
            1 => Some(LogoutReason::CloseConnection),
            2 => Some(LogoutReason::RemoveConnectionForRecovery),
            _ => None,
        }
    }
}

/// Logout response codes (RFC 3720 § 10.15.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogoutStatus {
    #[default]
    Success = 0,
    CidNotFound = 1,
    RecoveryNotSupported = 2,
    CleanupFailed = 3,
}
