// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Login/Text parameter negotiation.
//!
//! Each session owns a list of parameters with a declared category; the
//! engine takes the NUL-delimited `key=value` items of an incoming text
//! buffer and produces the answers:
//!
//! * Declarative — the peer's value is stored; a `?` query answers ours.
//! * Binary-or   — Yes iff either side proposed Yes.
//! * Binary-and  — Yes iff both sides proposed Yes.
//! * Numerical   — min(offer, local bound).
//! * Numerical-Z — like Numerical but zero means "no limit".
//! * List        — the first offered value we accept, else `Reject`.

use anyhow::{Result, bail};
use tracing::{error, trace};

use crate::cfg::{
    config::{DATA_SEGMENT_LENGTH, TARGET_PORTAL_GROUP_TAG},
    enums::YesNo,
};

pub const PARAM_KEY_LEN: usize = 64;
pub const PARAM_MAX_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Declarative,
    Numerical,
    /// Numerical where zero represents "no limit".
    NumericalZ,
    BinaryOr,
    BinaryAnd,
    List,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    ptype: ParamType,
    key: String,
    /// Comma-separated accepted values; the bound for numerical types.
    valid: String,
    value: String,
    /// Set while an incoming offer for this key awaits special handling
    /// (SendTargets is picked up by the session code this way).
    pub offer_rx: Option<String>,
}

fn binary_valid(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "yes,no" | "no,yes" | "yes" | "no"
    )
}

fn list_contains(list: &str, value: &str) -> bool {
    list.split(',').any(|item| item == value)
}

fn value_allowed(ptype: ParamType, valid: &str, value: &str) -> bool {
    match ptype {
        ParamType::Declarative => true,
        ParamType::Numerical | ParamType::NumericalZ => {
            let Ok(max) = valid.parse::<u64>() else {
                return false;
            };
            let Ok(val) = value.parse::<u64>() else {
                return false;
            };
            if val > max {
                if ptype == ParamType::Numerical {
                    return false;
                }
                // NumericalZ: 0 means no limit
                if max != 0 {
                    return false;
                }
            }
            true
        },
        ParamType::List => list_contains(valid, value),
        ParamType::BinaryOr | ParamType::BinaryAnd => binary_valid(value),
    }
}

#[derive(Debug, Default)]
pub struct ParamList {
    params: Vec<Parameter>,
}

impl ParamList {
    pub fn add(
        &mut self,
        ptype: ParamType,
        key: &str,
        dflt: &str,
        valid: &str,
    ) -> Result<()> {
        if key.len() > PARAM_KEY_LEN || dflt.len() > PARAM_MAX_LEN {
            bail!("parameter {key}: key or default too long");
        }
        match ptype {
            ParamType::Numerical | ParamType::NumericalZ => {
                if valid.parse::<u64>().is_err() {
                    bail!("declaration of parameter {key}: invalid bound {valid:?}");
                }
            },
            ParamType::BinaryOr | ParamType::BinaryAnd => {
                if !binary_valid(valid) {
                    bail!(
                        "declaration of parameter {key}: invalid accepted values {valid:?}"
                    );
                }
            },
            ParamType::Declarative | ParamType::List => {},
        }
        if !dflt.is_empty() && !value_allowed(ptype, valid, dflt) {
            bail!(
                "declaration of parameter {key}: invalid default {dflt:?} (accepted: {valid})"
            );
        }
        if self.exists(key) {
            bail!("parameter {key} already exists in the list");
        }
        trace!("{key:?}: valid {valid:?}, default {dflt:?}");
        self.params.push(Parameter {
            ptype,
            key: key.to_string(),
            valid: valid.to_string(),
            value: dflt.to_string(),
            offer_rx: None,
        });
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.params.iter().any(|p| p.key == key)
    }

    fn get(&self, key: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.key == key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.key == key)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).map(|p| p.value.as_str())
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match self.get_mut(key) {
            Some(p) => {
                p.value = value.to_string();
                Ok(())
            },
            None => bail!("key {key:?} not found in param list"),
        }
    }

    pub fn value_is_equal(&self, key: &str, value: &str) -> bool {
        self.value(key) == Some(value)
    }

    /// Consume a pending incoming offer for a key the session code answers
    /// itself (SendTargets).
    pub fn take_offer(&mut self, key: &str) -> Option<String> {
        self.get_mut(key).and_then(|p| p.offer_rx.take())
    }

    /// Parse an incoming text buffer and build the response items.
    ///
    /// Unknown keys are answered `NotUnderstood`; a value outside its
    /// category's grammar fails the whole negotiation.
    pub fn text_parse(&mut self, text: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        for item in text.split(|&b| b == 0) {
            if item.is_empty() {
                continue;
            }
            let item = std::str::from_utf8(item)
                .map_err(|_| anyhow::anyhow!("text item is not UTF-8"))?;
            let Some((key, offer)) = item.split_once('=') else {
                bail!("malformed text item {item:?}");
            };

            let Some(param) = self.get_mut(key) else {
                error!("unknown negotiation key {key:?}");
                text_add(&mut out, key, "NotUnderstood");
                continue;
            };

            if offer == "?" {
                let value = param.value.clone();
                text_add(&mut out, key, &value);
                continue;
            }

            match param.ptype {
                ParamType::Declarative => {
                    if offer.len() > PARAM_MAX_LEN {
                        bail!("value for {key} too long: {}", offer.len());
                    }
                    param.value = offer.to_string();
                    param.offer_rx = Some(offer.to_string());
                },
                ParamType::BinaryOr => {
                    let (local, remote) = binary_pair(param, offer)?;
                    let result = YesNo::from(local.as_bool() || remote.as_bool());
                    param.value = result.to_string();
                    text_add(&mut out, key, &result.to_string());
                },
                ParamType::BinaryAnd => {
                    let (local, remote) = binary_pair(param, offer)?;
                    let result = YesNo::from(local.as_bool() && remote.as_bool());
                    param.value = result.to_string();
                    text_add(&mut out, key, &result.to_string());
                },
                ParamType::Numerical => {
                    let local: u64 = param.valid.parse().expect("validated bound");
                    let remote: u64 = offer
                        .parse()
                        .map_err(|_| anyhow::anyhow!("bad numerical {key}={offer}"))?;
                    let result = remote.min(local);
                    param.value = result.to_string();
                    text_add(&mut out, key, &result.to_string());
                },
                ParamType::NumericalZ => {
                    let local: u64 = param.valid.parse().expect("validated bound");
                    let remote: u64 = offer
                        .parse()
                        .map_err(|_| anyhow::anyhow!("bad numerical {key}={offer}"))?;
                    // zero on either side means unbounded
                    let result = match (local, remote) {
                        (0, r) => r,
                        (l, 0) => l,
                        (l, r) => l.min(r),
                    };
                    param.value = result.to_string();
                    text_add(&mut out, key, &result.to_string());
                },
                ParamType::List => {
                    let choice = offer
                        .split(',')
                        .find(|candidate| list_contains(&param.valid, candidate));
                    match choice {
                        Some(value) => {
                            param.value = value.to_string();
                            text_add(&mut out, key, value);
                        },
                        None => {
                            error!("no acceptable value for {key} in offer {offer:?}");
                            text_add(&mut out, key, "Reject");
                        },
                    }
                },
            }
        }

        Ok(out)
    }
}

fn binary_pair(param: &Parameter, offer: &str) -> Result<(YesNo, YesNo)> {
    let local = YesNo::parse_wire(&param.value)
        .ok_or_else(|| anyhow::anyhow!("local value for {} not boolean", param.key))?;
    let remote = YesNo::parse_wire(offer).ok_or_else(|| {
        anyhow::anyhow!("bad boolean for {}: {offer:?}", param.key)
    })?;
    Ok((local, remote))
}

/// Append one `key=value` item, NUL-terminated.
pub fn text_add(out: &mut Vec<u8>, key: &str, value: &str) {
    out.extend_from_slice(key.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

/// The parameter table a fresh session negotiates from.
pub fn session_param_list(buffer_size: u32) -> ParamList {
    let mut l = ParamList::default();
    let dflt_segment = DATA_SEGMENT_LENGTH.to_string();
    let max_burst_valid = buffer_size.to_string();
    let tpgt = TARGET_PORTAL_GROUP_TAG.to_string();

    let add = [
        (ParamType::List, "AuthMethod", "None", "None"),
        (ParamType::Declarative, "TargetPortalGroupTag", tpgt.as_str(), ""),
        (ParamType::List, "HeaderDigest", "None", "None"),
        (ParamType::List, "DataDigest", "None", "None"),
        (ParamType::Numerical, "MaxConnections", "1", "1"),
        (ParamType::Declarative, "SendTargets", "", ""),
        (ParamType::Declarative, "TargetName", "", ""),
        (ParamType::Declarative, "InitiatorName", "", ""),
        (ParamType::Declarative, "TargetAlias", "", ""),
        (ParamType::Declarative, "InitiatorAlias", "", ""),
        (ParamType::Declarative, "TargetAddress", "", ""),
        (ParamType::BinaryOr, "InitialR2T", "Yes", "Yes,No"),
        (ParamType::BinaryAnd, "OFMarker", "No", "Yes,No"),
        (ParamType::BinaryAnd, "IFMarker", "No", "Yes,No"),
        (ParamType::NumericalZ, "OFMarkInt", "1", "65536"),
        (ParamType::NumericalZ, "IFMarkInt", "1", "65536"),
        (ParamType::BinaryAnd, "ImmediateData", "Yes", "Yes,No"),
        (ParamType::Numerical, "DefaultTime2Wait", "2", "2"),
        (ParamType::Numerical, "DefaultTime2Retain", "20", "20"),
        (ParamType::Numerical, "MaxOutstandingR2T", "1", "1"),
        (ParamType::BinaryOr, "DataPDUInOrder", "Yes", "Yes,No"),
        (ParamType::BinaryOr, "DataSequenceInOrder", "Yes", "Yes,No"),
        (ParamType::Numerical, "ErrorRecoveryLevel", "0", "0"),
        (ParamType::Declarative, "SessionType", "Normal", "Normal,Discovery"),
    ];
    for (ptype, k, dflt, valid) in add {
        l.add(ptype, k, dflt, valid).expect("static parameter table");
    }

    // force FirstBurstLength and MaxRecvDataSegmentLength to the default
    // segment size; MaxBurstLength may negotiate up to the buffer size
    l.add(
        ParamType::NumericalZ,
        "MaxRecvDataSegmentLength",
        &dflt_segment,
        &dflt_segment,
    )
    .expect("static parameter table");
    l.add(
        ParamType::NumericalZ,
        "FirstBurstLength",
        &dflt_segment,
        &dflt_segment,
    )
    .expect("static parameter table");
    l.add(
        ParamType::NumericalZ,
        "MaxBurstLength",
        &dflt_segment,
        &max_burst_valid,
    )
    .expect("static parameter table");

    l
}

/// Negotiated values the data path consults on every PDU.
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub max_recv_data_segment_length: u32,
    pub initial_r2t: bool,
    pub immediate_data: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_burst_length: DATA_SEGMENT_LENGTH,
            first_burst_length: DATA_SEGMENT_LENGTH,
            max_recv_data_segment_length: DATA_SEGMENT_LENGTH,
            initial_r2t: true,
            immediate_data: true,
        }
    }
}

impl SessionParams {
    pub fn from_list(list: &ParamList) -> Self {
        let number = |key: &str, dflt: u32| {
            list.value(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(dflt)
        };
        let boolean = |key: &str, dflt: bool| {
            list.value(key)
                .and_then(YesNo::parse_wire)
                .map(YesNo::as_bool)
                .unwrap_or(dflt)
        };
        SessionParams {
            max_burst_length: number("MaxBurstLength", DATA_SEGMENT_LENGTH),
            first_burst_length: number("FirstBurstLength", DATA_SEGMENT_LENGTH),
            max_recv_data_segment_length: number(
                "MaxRecvDataSegmentLength",
                DATA_SEGMENT_LENGTH,
            ),
            initial_r2t: boolean("InitialR2T", true),
            immediate_data: boolean("ImmediateData", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(buf: &[u8]) -> Vec<String> {
        buf.split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    fn text(pairs: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in pairs {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn declarative_query_answers_stored_value() {
        let mut l = ParamList::default();
        for (k, v) in [("key1", "val1"), ("key2", "val2"), ("key3", "val3")] {
            l.add(ParamType::Declarative, k, v, "").expect("add");
        }
        let out = l
            .text_parse(&text(&["key1=?", "key2=?", "key3=?"]))
            .expect("parse");
        assert_eq!(items(&out), vec!["key1=val1", "key2=val2", "key3=val3"]);
    }

    #[test]
    fn numerical_answers_minimum() {
        let mut l = ParamList::default();
        l.add(ParamType::Numerical, "key1", "1", "10").expect("add");
        l.add(ParamType::Numerical, "key2", "2", "4").expect("add");
        let out = l
            .text_parse(&text(&["key1=7", "key2=9"]))
            .expect("parse");
        assert_eq!(items(&out), vec!["key1=7", "key2=4"]);
        assert_eq!(l.value("key1"), Some("7"));
    }

    #[test]
    fn numerical_z_zero_means_unbounded() {
        let mut l = ParamList::default();
        l.add(ParamType::NumericalZ, "a", "1", "0").expect("add");
        l.add(ParamType::NumericalZ, "b", "1", "100").expect("add");
        let out = l.text_parse(&text(&["a=500", "b=0"])).expect("parse");
        assert_eq!(items(&out), vec!["a=500", "b=100"]);
    }

    #[test]
    fn binary_or_and() {
        let mut l = ParamList::default();
        l.add(ParamType::BinaryOr, "InitialR2T", "Yes", "Yes,No")
            .expect("add");
        l.add(ParamType::BinaryAnd, "ImmediateData", "Yes", "Yes,No")
            .expect("add");
        let out = l
            .text_parse(&text(&["InitialR2T=No", "ImmediateData=No"]))
            .expect("parse");
        // or: local Yes wins; and: remote No wins
        assert_eq!(items(&out), vec!["InitialR2T=Yes", "ImmediateData=No"]);
    }

    #[test]
    fn list_takes_first_acceptable_offer() {
        let mut l = ParamList::default();
        l.add(ParamType::List, "HeaderDigest", "None", "None")
            .expect("add");
        let out = l
            .text_parse(&text(&["HeaderDigest=CRC32C,None"]))
            .expect("parse");
        assert_eq!(items(&out), vec!["HeaderDigest=None"]);

        let out = l
            .text_parse(&text(&["HeaderDigest=CRC32C"]))
            .expect("parse");
        assert_eq!(items(&out), vec!["HeaderDigest=Reject"]);
    }

    #[test]
    fn unknown_key_is_not_understood() {
        let mut l = ParamList::default();
        let out = l.text_parse(&text(&["X-weird=1"])).expect("parse");
        assert_eq!(items(&out), vec!["X-weird=NotUnderstood"]);
    }

    #[test]
    fn bad_boolean_fails_negotiation() {
        let mut l = ParamList::default();
        l.add(ParamType::BinaryOr, "InitialR2T", "Yes", "Yes,No")
            .expect("add");
        assert!(l.text_parse(&text(&["InitialR2T=Maybe"])).is_err());
    }

    #[test]
    fn session_table_has_the_profile_defaults() {
        let l = session_param_list(DATA_SEGMENT_LENGTH);
        assert_eq!(l.value("AuthMethod"), Some("None"));
        assert_eq!(l.value("MaxConnections"), Some("1"));
        assert_eq!(l.value("DefaultTime2Wait"), Some("2"));
        assert_eq!(l.value("DefaultTime2Retain"), Some("20"));
        assert_eq!(l.value("ErrorRecoveryLevel"), Some("0"));
        assert_eq!(l.value("MaxRecvDataSegmentLength"), Some("262144"));
        assert_eq!(l.value("SessionType"), Some("Normal"));
    }

    #[test]
    fn duplicate_parameter_is_refused() {
        let mut l = ParamList::default();
        l.add(ParamType::Declarative, "k", "", "").expect("add");
        assert!(l.add(ParamType::Declarative, "k", "", "").is_err());
    }
}
