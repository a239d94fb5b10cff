// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! iSCSI qualified names.
//!
//! A *regular* IQN contains no wildcard. A *pattern* contains exactly one
//! `*` and is only used inside IQN filters. Comparing regular-to-pattern
//! goes through [`Iqn::matches`].

use core::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Maximum length of an IQN string.
pub const IQN_MAX_LEN: usize = 127;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Iqn(String);

impl Iqn {
    /// Parse a string as an IQN or a pattern. ASCII is lower-cased, which is
    /// what every initiator stack sends anyway.
    pub fn new(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("empty IQN");
        }
        if s.len() > IQN_MAX_LEN {
            bail!("IQN longer than {IQN_MAX_LEN} chars: {}", s.len());
        }
        if s.matches('*').count() > 1 {
            bail!("IQN contains more than one wildcard: {s}");
        }
        Ok(Iqn(s.to_ascii_lowercase()))
    }

    /// Like [`Iqn::new`] from format arguments; the target IQN is built this
    /// way from the cluster name.
    pub fn format(args: fmt::Arguments<'_>) -> Result<Self> {
        Self::new(&args.to_string())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A regular IQN carries no wildcard.
    #[inline]
    pub fn is_regular(&self) -> bool {
        !self.0.contains('*')
    }

    /// A pattern carries exactly one wildcard (guaranteed by construction).
    #[inline]
    pub fn is_pattern(&self) -> bool {
        self.0.contains('*')
    }

    /// Match `self` (which must be regular) against `filter`, which is either
    /// a regular IQN (string equality) or a pattern (wildcard-segment match
    /// around the single `*`).
    pub fn matches(&self, filter: &Iqn) -> bool {
        if !self.is_regular() {
            return false;
        }
        match filter.0.split_once('*') {
            None => self.0 == filter.0,
            Some((prefix, suffix)) => {
                self.0.len() >= prefix.len() + suffix.len()
                    && self.0.starts_with(prefix)
                    && self.0.ends_with(suffix)
            },
        }
    }
}

impl fmt::Display for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Iqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iqn({})", self.0)
    }
}

impl FromStr for Iqn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Iqn::new(s)
    }
}

impl TryFrom<String> for Iqn {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Iqn::new(&s)
    }
}

impl From<Iqn> for String {
    fn from(iqn: Iqn) -> String {
        iqn.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iqn_lower_cases_ascii() {
        let iqn = Iqn::new("IQN.2004-05.com.Seanodes:SB8").expect("valid");
        assert_eq!(iqn.as_str(), "iqn.2004-05.com.seanodes:sb8");
    }

    #[test]
    fn iqn_rejects_empty_and_too_long() {
        assert!(Iqn::new("").is_err());
        let long = "i".repeat(IQN_MAX_LEN + 1);
        assert!(Iqn::new(&long).is_err());
        let max = "i".repeat(IQN_MAX_LEN);
        assert!(Iqn::new(&max).is_ok());
    }

    #[test]
    fn iqn_rejects_two_wildcards() {
        assert!(Iqn::new("iqn.*.example:*").is_err());
        assert!(Iqn::new("iqn.2020-01.example:*").is_ok());
    }

    #[test]
    fn regular_matches_regular_by_equality() {
        let a = Iqn::new("iqn.2020-01.example:host1").expect("valid");
        let b = Iqn::new("IQN.2020-01.EXAMPLE:HOST1").expect("valid");
        let c = Iqn::new("iqn.2020-01.example:host2").expect("valid");
        assert!(a.matches(&b));
        assert!(!a.matches(&c));
    }

    #[test]
    fn pattern_matching_around_wildcard() {
        let pat = Iqn::new("iqn.2020-01.example:*").expect("valid");
        let yes = Iqn::new("iqn.2020-01.example:host1").expect("valid");
        let no = Iqn::new("iqn.2020-02.example:host1").expect("valid");
        assert!(yes.matches(&pat));
        assert!(!no.matches(&pat));

        let mid = Iqn::new("iqn.*.example:host").expect("valid");
        assert!(
            Iqn::new("iqn.2010-01.example:host")
                .expect("valid")
                .matches(&mid)
        );
        assert!(
            !Iqn::new("iqn.2010-01.example:other")
                .expect("valid")
                .matches(&mid)
        );
    }

    #[test]
    fn star_alone_matches_everything() {
        let pat = Iqn::new("*").expect("valid");
        assert!(Iqn::new("iqn.x").expect("valid").matches(&pat));
    }

    #[test]
    fn pattern_never_matches_as_subject() {
        let pat = Iqn::new("iqn.2020-01.example:*").expect("valid");
        assert!(!pat.clone().matches(&pat));
    }

    #[test]
    fn overlapping_prefix_suffix_does_not_match() {
        // "iqn.a*a.com" must not match "iqn.a.com" even though prefix and
        // suffix individually match with overlap.
        let pat = Iqn::new("iqn.a*a.com").expect("valid");
        assert!(!Iqn::new("iqn.a.com").expect("valid").matches(&pat));
        assert!(Iqn::new("iqn.axa.com").expect("valid").matches(&pat));
    }
}
