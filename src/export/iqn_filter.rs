// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-export initiator filtering: an ordered list of `(pattern, policy)`
//! pairs, first match wins.

use core::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::export::iqn::Iqn;

/// Whether a matching initiator is let in or turned away. The string forms
/// are stable: they are written to the persisted exports file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterPolicy {
    #[serde(rename = "ACCEPT", alias = "accept")]
    Accept,
    #[serde(rename = "REJECT", alias = "reject")]
    Reject,
}

impl fmt::Display for FilterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterPolicy::Accept => "ACCEPT",
            FilterPolicy::Reject => "REJECT",
        })
    }
}

impl FromStr for FilterPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACCEPT" | "accept" => Ok(FilterPolicy::Accept),
            "REJECT" | "reject" => Ok(FilterPolicy::Reject),
            other => bail!("unknown IQN filter policy: {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IqnFilter {
    pattern: Iqn,
    policy: FilterPolicy,
}

impl IqnFilter {
    pub fn new(pattern: Iqn, policy: FilterPolicy) -> Self {
        IqnFilter { pattern, policy }
    }

    #[inline]
    pub fn pattern(&self) -> &Iqn {
        &self.pattern
    }

    #[inline]
    pub fn policy(&self) -> FilterPolicy {
        self.policy
    }

    /// Returns this filter's policy when the IQN matches the pattern.
    pub fn matches(&self, iqn: &Iqn) -> Option<FilterPolicy> {
        iqn.matches(&self.pattern).then_some(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_strings_are_stable() {
        assert_eq!(FilterPolicy::Accept.to_string(), "ACCEPT");
        assert_eq!(FilterPolicy::Reject.to_string(), "REJECT");
        assert_eq!(
            "ACCEPT".parse::<FilterPolicy>().expect("parse"),
            FilterPolicy::Accept
        );
        assert_eq!(
            "REJECT".parse::<FilterPolicy>().expect("parse"),
            FilterPolicy::Reject
        );
        assert!("Allow".parse::<FilterPolicy>().is_err());
    }

    #[test]
    fn filter_matches_returns_policy() {
        let f = IqnFilter::new(
            Iqn::new("iqn.2020-01.example:*").expect("valid"),
            FilterPolicy::Reject,
        );
        let hit = Iqn::new("iqn.2020-01.example:host1").expect("valid");
        let miss = Iqn::new("iqn.2020-02.example:host1").expect("valid");
        assert_eq!(f.matches(&hit), Some(FilterPolicy::Reject));
        assert_eq!(f.matches(&miss), None);
    }
}
