// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cluster volume UUID: four 32-bit words, printed as
//! `HHHHHHHH:HHHHHHHH:HHHHHHHH:HHHHHHHH` (upper-case hex).

use core::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};

/// Length of the canonical string form, without the trailing NUL.
pub const UUID_STR_LEN: usize = 4 * 8 + 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExaUuid(pub [u32; 4]);

impl ExaUuid {
    pub const ZERO: ExaUuid = ExaUuid([0; 4]);

    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Wire form: the four words big-endian, 16 bytes.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, w) in self.0.iter().enumerate() {
            out[i * 4..(i + 1) * 4].copy_from_slice(&w.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_be_bytes([
                buf[i * 4],
                buf[i * 4 + 1],
                buf[i * 4 + 2],
                buf[i * 4 + 3],
            ]);
        }
        ExaUuid(words)
    }
}

impl fmt::Display for ExaUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}:{:08X}:{:08X}:{:08X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl FromStr for ExaUuid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = [0u32; 4];
        let mut n = 0;
        for part in s.split(':') {
            if n == 4 {
                bail!("UUID has more than 4 words: {s}");
            }
            if part.len() != 8 {
                bail!("UUID word {n} is not 8 hex digits: {s}");
            }
            words[n] = u32::from_str_radix(part, 16)
                .map_err(|e| anyhow::anyhow!("invalid UUID word {part:?}: {e}"))?;
            n += 1;
        }
        if n != 4 {
            bail!("UUID has {n} words, expected 4: {s}");
        }
        Ok(ExaUuid(words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_string_round_trip() {
        let u = ExaUuid([0xDEADBEEF, 0x01234567, 0x89ABCDEF, 0x00000001]);
        let s = u.to_string();
        assert_eq!(s, "DEADBEEF:01234567:89ABCDEF:00000001");
        assert_eq!(s.len(), UUID_STR_LEN);
        assert_eq!(s.parse::<ExaUuid>().expect("parse"), u);
    }

    #[test]
    fn uuid_accepts_lower_case() {
        let u: ExaUuid = "deadbeef:01234567:89abcdef:00000001"
            .parse()
            .expect("parse");
        assert_eq!(u.0[0], 0xDEADBEEF);
    }

    #[test]
    fn uuid_rejects_malformed() {
        assert!("".parse::<ExaUuid>().is_err());
        assert!("DEADBEEF".parse::<ExaUuid>().is_err());
        assert!("DEADBEEF:01234567:89ABCDEF".parse::<ExaUuid>().is_err());
        assert!(
            "DEADBEEF:01234567:89ABCDEF:00000001:FF"
                .parse::<ExaUuid>()
                .is_err()
        );
        assert!(
            "XEADBEEF:01234567:89ABCDEF:00000001"
                .parse::<ExaUuid>()
                .is_err()
        );
    }

    #[test]
    fn uuid_bytes_round_trip() {
        let u = ExaUuid([1, 2, 3, 0xFFFFFFFF]);
        assert_eq!(ExaUuid::from_bytes(&u.to_bytes()), u);
        assert_eq!(u.to_bytes()[0..4], [0, 0, 0, 1]);
    }
}
