// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The export record: how one cluster volume is made visible to the outside,
//! either as an iSCSI logical unit or as a local block device.
//!
//! Exports travel between nodes during reconciliation as a flat, fixed-size
//! byte image, so the layout must stay pointer-free and position-stable.

use anyhow::{Result, bail};

use crate::{
    errors::LumError,
    export::{
        iqn::{IQN_MAX_LEN, Iqn},
        iqn_filter::{FilterPolicy, IqnFilter},
        lun::Lun,
        uuid::ExaUuid,
    },
};

/// Longest accepted block-device path.
pub const MAX_PATH: usize = 128;

/// Upper bound on IQN filters per export.
pub const MAX_FILTERS: usize = 8;

const TYPE_BDEV: u8 = 0;
const TYPE_ISCSI: u8 = 1;

const IQN_SLOT: usize = IQN_MAX_LEN + 1;
const ISCSI_PAYLOAD: usize = 2 + 1 + 2 + MAX_FILTERS * (IQN_SLOT + 1);
const BDEV_PAYLOAD: usize = MAX_PATH + 1;
const PAYLOAD_SIZE: usize = if ISCSI_PAYLOAD > BDEV_PAYLOAD {
    ISCSI_PAYLOAD
} else {
    BDEV_PAYLOAD
};

/// Size of the serialized image, identical for both variants.
pub const SERIALIZED_SIZE: usize = 1 + 1 + 16 + PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExportKind {
    Bdev {
        path: String,
    },
    Iscsi {
        lun: Lun,
        filter_policy: FilterPolicy,
        filters: Vec<IqnFilter>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    uuid: ExaUuid,
    readonly: bool,
    kind: ExportKind,
}

impl Export {
    pub fn new_bdev(uuid: ExaUuid, path: &str) -> Result<Self> {
        if path.is_empty() || path.len() > MAX_PATH {
            bail!("invalid bdev path length: {}", path.len());
        }
        Ok(Export {
            uuid,
            readonly: false,
            kind: ExportKind::Bdev {
                path: path.to_string(),
            },
        })
    }

    pub fn new_iscsi(uuid: ExaUuid, lun: Lun, filter_policy: FilterPolicy) -> Self {
        Export {
            uuid,
            readonly: false,
            kind: ExportKind::Iscsi {
                lun,
                filter_policy,
                filters: Vec::new(),
            },
        }
    }

    #[inline]
    pub fn uuid(&self) -> &ExaUuid {
        &self.uuid
    }

    #[inline]
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    #[inline]
    pub fn is_iscsi(&self) -> bool {
        matches!(self.kind, ExportKind::Iscsi { .. })
    }

    #[inline]
    pub fn is_bdev(&self) -> bool {
        matches!(self.kind, ExportKind::Bdev { .. })
    }

    /// Path of a bdev export, `None` on iSCSI exports.
    pub fn bdev_path(&self) -> Option<&str> {
        match &self.kind {
            ExportKind::Bdev { path } => Some(path),
            ExportKind::Iscsi { .. } => None,
        }
    }

    /// LUN of an iSCSI export, `None` on bdev exports.
    pub fn iscsi_lun(&self) -> Option<Lun> {
        match &self.kind {
            ExportKind::Iscsi { lun, .. } => Some(*lun),
            ExportKind::Bdev { .. } => None,
        }
    }

    pub fn iscsi_set_lun(&mut self, new_lun: Lun) -> Result<(), LumError> {
        match &mut self.kind {
            ExportKind::Iscsi { lun, .. } => {
                *lun = new_lun;
                Ok(())
            },
            ExportKind::Bdev { .. } => Err(LumError::ExportWrongMethod),
        }
    }

    pub fn iscsi_filter_policy(&self) -> Option<FilterPolicy> {
        match &self.kind {
            ExportKind::Iscsi { filter_policy, .. } => Some(*filter_policy),
            ExportKind::Bdev { .. } => None,
        }
    }

    pub fn iscsi_set_filter_policy(
        &mut self,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        match &mut self.kind {
            ExportKind::Iscsi { filter_policy, .. } => {
                *filter_policy = policy;
                Ok(())
            },
            ExportKind::Bdev { .. } => Err(LumError::ExportWrongMethod),
        }
    }

    fn iscsi_filters(&self) -> Option<&Vec<IqnFilter>> {
        match &self.kind {
            ExportKind::Iscsi { filters, .. } => Some(filters),
            ExportKind::Bdev { .. } => None,
        }
    }

    fn iscsi_filters_mut(&mut self) -> Result<&mut Vec<IqnFilter>, LumError> {
        match &mut self.kind {
            ExportKind::Iscsi { filters, .. } => Ok(filters),
            ExportKind::Bdev { .. } => Err(LumError::ExportWrongMethod),
        }
    }

    pub fn iqn_filters_number(&self) -> usize {
        self.iscsi_filters().map_or(0, Vec::len)
    }

    pub fn nth_iqn_filter(&self, n: usize) -> Option<&IqnFilter> {
        self.iscsi_filters().and_then(|f| f.get(n))
    }

    /// Append a filter. Order matters: [`Export::policy_for_iqn`] takes the
    /// first matching entry.
    pub fn add_iqn_filter(
        &mut self,
        pattern: Iqn,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        let filters = self.iscsi_filters_mut()?;
        if filters.iter().any(|f| *f.pattern() == pattern) {
            return Err(LumError::DuplicateIqnFilter);
        }
        if filters.len() >= MAX_FILTERS {
            return Err(LumError::TooManyIqnFilters);
        }
        filters.push(IqnFilter::new(pattern, policy));
        Ok(())
    }

    /// Remove the filter with the given pattern, preserving insertion order
    /// of the others.
    pub fn remove_iqn_filter(&mut self, pattern: &Iqn) -> Result<(), LumError> {
        let filters = self.iscsi_filters_mut()?;
        match filters.iter().position(|f| f.pattern() == pattern) {
            Some(pos) => {
                filters.remove(pos);
                Ok(())
            },
            None => Err(LumError::IqnFilterNotFound),
        }
    }

    pub fn clear_iqn_filters(&mut self) -> Result<(), LumError> {
        self.iscsi_filters_mut()?.clear();
        Ok(())
    }

    /// Drop every filter carrying exactly this policy.
    pub fn clear_iqn_filters_policy(
        &mut self,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.iscsi_filters_mut()?.retain(|f| f.policy() != policy);
        Ok(())
    }

    /// Replace this export's filter list and default policy with `src`'s.
    /// Both exports must be iSCSI.
    pub fn copy_iqn_filters(&mut self, src: &Export) -> Result<(), LumError> {
        let (src_policy, src_filters) = match &src.kind {
            ExportKind::Iscsi {
                filter_policy,
                filters,
                ..
            } => (*filter_policy, filters.clone()),
            ExportKind::Bdev { .. } => return Err(LumError::ExportWrongMethod),
        };
        match &mut self.kind {
            ExportKind::Iscsi {
                filter_policy,
                filters,
                ..
            } => {
                *filter_policy = src_policy;
                *filters = src_filters;
                Ok(())
            },
            ExportKind::Bdev { .. } => Err(LumError::ExportWrongMethod),
        }
    }

    /// Effective policy for an initiator: the policy of the first matching
    /// filter, or the export's default policy when none matches.
    pub fn policy_for_iqn(&self, iqn: &Iqn) -> FilterPolicy {
        match &self.kind {
            ExportKind::Iscsi {
                filter_policy,
                filters,
                ..
            } => filters
                .iter()
                .find_map(|f| f.matches(iqn))
                .unwrap_or(*filter_policy),
            // Bdev exports are invisible to initiators.
            ExportKind::Bdev { .. } => FilterPolicy::Reject,
        }
    }

    pub const fn serialized_size() -> usize {
        SERIALIZED_SIZE
    }

    /// Flat image: `type | readonly | uuid(16) | payload`, padded to
    /// [`SERIALIZED_SIZE`]. Fails with `InvalidParam` on a short buffer.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, LumError> {
        if buf.len() < SERIALIZED_SIZE {
            return Err(LumError::InvalidParam);
        }
        buf[..SERIALIZED_SIZE].fill(0);
        buf[0] = match &self.kind {
            ExportKind::Bdev { .. } => TYPE_BDEV,
            ExportKind::Iscsi { .. } => TYPE_ISCSI,
        };
        buf[1] = self.readonly as u8;
        buf[2..18].copy_from_slice(&self.uuid.to_bytes());
        let payload = &mut buf[18..SERIALIZED_SIZE];
        match &self.kind {
            ExportKind::Bdev { path } => {
                payload[..path.len()].copy_from_slice(path.as_bytes());
            },
            ExportKind::Iscsi {
                lun,
                filter_policy,
                filters,
            } => {
                payload[0..2].copy_from_slice(&(lun.value() as u16).to_be_bytes());
                payload[2] = match filter_policy {
                    FilterPolicy::Accept => 0,
                    FilterPolicy::Reject => 1,
                };
                payload[3..5].copy_from_slice(&(filters.len() as u16).to_be_bytes());
                for (i, f) in filters.iter().enumerate() {
                    let at = 5 + i * (IQN_SLOT + 1);
                    let pat = f.pattern().as_str().as_bytes();
                    payload[at..at + pat.len()].copy_from_slice(pat);
                    payload[at + IQN_SLOT] = match f.policy() {
                        FilterPolicy::Accept => 0,
                        FilterPolicy::Reject => 1,
                    };
                }
            },
        }
        Ok(SERIALIZED_SIZE)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, LumError> {
        if buf.len() < SERIALIZED_SIZE {
            return Err(LumError::InvalidParam);
        }
        let readonly = match buf[1] {
            0 => false,
            1 => true,
            _ => return Err(LumError::InvalidParam),
        };
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes.copy_from_slice(&buf[2..18]);
        let uuid = ExaUuid::from_bytes(&uuid_bytes);
        let payload = &buf[18..SERIALIZED_SIZE];

        let kind = match buf[0] {
            TYPE_BDEV => {
                let end = payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(payload.len());
                let path = std::str::from_utf8(&payload[..end])
                    .map_err(|_| LumError::InvalidParam)?;
                if path.is_empty() || path.len() > MAX_PATH {
                    return Err(LumError::InvalidParam);
                }
                ExportKind::Bdev {
                    path: path.to_string(),
                }
            },
            TYPE_ISCSI => {
                let lun = Lun::new(u16::from_be_bytes([payload[0], payload[1]]) as u64)
                    .map_err(|_| LumError::InvalidParam)?;
                let filter_policy = match payload[2] {
                    0 => FilterPolicy::Accept,
                    1 => FilterPolicy::Reject,
                    _ => return Err(LumError::InvalidParam),
                };
                let count = u16::from_be_bytes([payload[3], payload[4]]) as usize;
                if count > MAX_FILTERS {
                    return Err(LumError::InvalidParam);
                }
                let mut filters = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 5 + i * (IQN_SLOT + 1);
                    let slot = &payload[at..at + IQN_SLOT];
                    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
                    let pattern = std::str::from_utf8(&slot[..end])
                        .ok()
                        .and_then(|s| Iqn::new(s).ok())
                        .ok_or(LumError::InvalidParam)?;
                    let policy = match payload[at + IQN_SLOT] {
                        0 => FilterPolicy::Accept,
                        1 => FilterPolicy::Reject,
                        _ => return Err(LumError::InvalidParam),
                    };
                    filters.push(IqnFilter::new(pattern, policy));
                }
                ExportKind::Iscsi {
                    lun,
                    filter_policy,
                    filters,
                }
            },
            _ => return Err(LumError::InvalidParam),
        };

        Ok(Export {
            uuid,
            readonly,
            kind,
        })
    }
}

/// Admin-facing summary of an export, handed to clinfo-style queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportInfo {
    Bdev { uuid: ExaUuid, path: String },
    Iscsi { uuid: ExaUuid, lun: Lun },
}

impl Export {
    pub fn info(&self) -> ExportInfo {
        match &self.kind {
            ExportKind::Bdev { path } => ExportInfo::Bdev {
                uuid: self.uuid,
                path: path.clone(),
            },
            ExportKind::Iscsi { lun, .. } => ExportInfo::Iscsi {
                uuid: self.uuid,
                lun: *lun,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u32) -> ExaUuid {
        ExaUuid([n, n + 1, n + 2, n + 3])
    }

    fn iqn(s: &str) -> Iqn {
        Iqn::new(s).expect("valid IQN")
    }

    fn sample_iscsi() -> Export {
        let mut e = Export::new_iscsi(
            uuid(7),
            Lun::new(3).expect("valid"),
            FilterPolicy::Accept,
        );
        e.add_iqn_filter(iqn("iqn.2020-01.example:*"), FilterPolicy::Reject)
            .expect("add");
        e.add_iqn_filter(iqn("iqn.2021-06.lab:host9"), FilterPolicy::Accept)
            .expect("add");
        e
    }

    #[test]
    fn serialize_round_trip_iscsi() {
        let e = sample_iscsi();
        let mut buf = vec![0u8; Export::serialized_size()];
        let n = e.serialize(&mut buf).expect("serialize");
        assert_eq!(n, SERIALIZED_SIZE);
        let back = Export::deserialize(&buf).expect("deserialize");
        assert_eq!(back, e);
    }

    #[test]
    fn serialize_round_trip_bdev() {
        let mut e = Export::new_bdev(uuid(1), "/dev/exa/vol0").expect("bdev");
        e.set_readonly(true);
        let mut buf = vec![0u8; Export::serialized_size()];
        e.serialize(&mut buf).expect("serialize");
        let back = Export::deserialize(&buf).expect("deserialize");
        assert_eq!(back, e);
        assert!(back.readonly());
        assert_eq!(back.bdev_path(), Some("/dev/exa/vol0"));
    }

    #[test]
    fn serialize_rejects_short_buffer() {
        let e = sample_iscsi();
        let mut buf = vec![0u8; Export::serialized_size() - 1];
        assert_eq!(e.serialize(&mut buf), Err(LumError::InvalidParam));
        assert_eq!(
            Export::deserialize(&buf).expect_err("short"),
            LumError::InvalidParam
        );
    }

    #[test]
    fn filter_capacity_is_enforced() {
        let mut e =
            Export::new_iscsi(uuid(2), Lun::new(0).expect("valid"), FilterPolicy::Reject);
        for i in 0..MAX_FILTERS {
            e.add_iqn_filter(iqn(&format!("iqn.x:{i}")), FilterPolicy::Accept)
                .expect("add");
        }
        assert_eq!(
            e.add_iqn_filter(iqn("iqn.x:overflow"), FilterPolicy::Accept),
            Err(LumError::TooManyIqnFilters)
        );
    }

    #[test]
    fn duplicate_filter_is_rejected() {
        let mut e =
            Export::new_iscsi(uuid(2), Lun::new(0).expect("valid"), FilterPolicy::Accept);
        e.add_iqn_filter(iqn("iqn.x:a"), FilterPolicy::Accept)
            .expect("add");
        assert_eq!(
            e.add_iqn_filter(iqn("iqn.x:a"), FilterPolicy::Reject),
            Err(LumError::DuplicateIqnFilter)
        );
    }

    #[test]
    fn remove_preserves_order() {
        let mut e =
            Export::new_iscsi(uuid(2), Lun::new(0).expect("valid"), FilterPolicy::Accept);
        for name in ["iqn.x:a", "iqn.x:b", "iqn.x:c"] {
            e.add_iqn_filter(iqn(name), FilterPolicy::Accept)
                .expect("add");
        }
        e.remove_iqn_filter(&iqn("iqn.x:b")).expect("remove");
        assert_eq!(e.iqn_filters_number(), 2);
        assert_eq!(
            e.nth_iqn_filter(0).expect("nth").pattern().as_str(),
            "iqn.x:a"
        );
        assert_eq!(
            e.nth_iqn_filter(1).expect("nth").pattern().as_str(),
            "iqn.x:c"
        );
        assert_eq!(
            e.remove_iqn_filter(&iqn("iqn.x:b")),
            Err(LumError::IqnFilterNotFound)
        );
    }

    #[test]
    fn clear_by_policy() {
        let mut e =
            Export::new_iscsi(uuid(2), Lun::new(0).expect("valid"), FilterPolicy::Accept);
        e.add_iqn_filter(iqn("iqn.x:a"), FilterPolicy::Accept)
            .expect("add");
        e.add_iqn_filter(iqn("iqn.x:b"), FilterPolicy::Reject)
            .expect("add");
        e.add_iqn_filter(iqn("iqn.x:c"), FilterPolicy::Accept)
            .expect("add");
        e.clear_iqn_filters_policy(FilterPolicy::Accept)
            .expect("clear");
        assert_eq!(e.iqn_filters_number(), 1);
        assert_eq!(
            e.nth_iqn_filter(0).expect("nth").policy(),
            FilterPolicy::Reject
        );
    }

    #[test]
    fn first_matching_filter_wins() {
        let mut e =
            Export::new_iscsi(uuid(2), Lun::new(0).expect("valid"), FilterPolicy::Accept);
        e.add_iqn_filter(iqn("iqn.2020-01.example:*"), FilterPolicy::Reject)
            .expect("add");
        e.add_iqn_filter(iqn("iqn.2020-01.example:host1"), FilterPolicy::Accept)
            .expect("add");
        // the wildcard entry comes first, so it decides
        assert_eq!(
            e.policy_for_iqn(&iqn("iqn.2020-01.example:host1")),
            FilterPolicy::Reject
        );
        // no filter matches: fall back to the export default
        assert_eq!(
            e.policy_for_iqn(&iqn("iqn.2099-12.other:host")),
            FilterPolicy::Accept
        );
    }

    #[test]
    fn info_reports_the_addressing() {
        let e = sample_iscsi();
        assert_eq!(
            e.info(),
            ExportInfo::Iscsi {
                uuid: uuid(7),
                lun: Lun::new(3).expect("valid"),
            }
        );
        let b = Export::new_bdev(uuid(1), "/dev/exa/v").expect("bdev");
        assert_eq!(
            b.info(),
            ExportInfo::Bdev {
                uuid: uuid(1),
                path: "/dev/exa/v".to_string(),
            }
        );
    }

    #[test]
    fn filter_ops_rejected_on_bdev() {
        let mut e = Export::new_bdev(uuid(4), "/dev/sda").expect("bdev");
        assert_eq!(
            e.add_iqn_filter(iqn("iqn.x:a"), FilterPolicy::Accept),
            Err(LumError::ExportWrongMethod)
        );
        assert_eq!(
            e.iscsi_set_lun(Lun::new(1).expect("valid")),
            Err(LumError::ExportWrongMethod)
        );
        assert_eq!(e.iscsi_lun(), None);
    }
}
