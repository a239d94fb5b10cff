// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean negotiation value with the wire spellings initiators send.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}

impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}

impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}

impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }

    /// Wire parse; anything but the two canonical spellings is a protocol
    /// error on a Binary-valued key.
    pub fn parse_wire(s: &str) -> Option<Self> {
        match s {
            "Yes" | "yes" => Some(YesNo::Yes),
            "No" | "no" => Some(YesNo::No),
            _ => None,
        }
    }
}

/// Session type negotiated at login. Discovery sessions only ever answer
/// SendTargets; Normal sessions reach the SCSI layer.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    #[serde(rename = "Discovery", alias = "discovery", alias = "DISCOVERY")]
    Discovery,
    #[default]
    #[serde(rename = "Normal", alias = "normal", alias = "NORMAL")]
    Normal,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionType::Discovery => "Discovery",
            SessionType::Normal => "Normal",
        })
    }
}

impl SessionType {
    pub fn is_discovery(&self) -> bool {
        matches!(self, SessionType::Discovery)
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, SessionType::Normal)
    }
}
