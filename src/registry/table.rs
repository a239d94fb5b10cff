// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The authoritative export catalog of a node.
//!
//! The table is a bounded array ordered by insertion; order carries no
//! meaning, removal shifts, and `get_nth` feeds the reconcile stream. Every
//! successful mutation bumps the version so reconciliation can pick the
//! freshest replica after a membership change.

use tracing::warn;

use crate::{
    errors::LumError,
    export::{
        export::Export,
        iqn::Iqn,
        iqn_filter::FilterPolicy,
        lun::{Lun, MAX_LUNS},
        uuid::ExaUuid,
    },
};

/// Capacity of the table.
pub const MAX_EXPORTS: usize = 512;

/// Version of a freshly created (or legacy, unversioned) exports file.
pub const EXPORTS_VERSION_DEFAULT: u64 = 1;

/// An export as the registry tracks it: the description plus whether the
/// local executive has materialized it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmExport {
    export: Export,
    published: bool,
}

impl AdmExport {
    pub fn new(export: Export) -> Self {
        AdmExport {
            export,
            published: false,
        }
    }

    pub fn export(&self) -> &Export {
        &self.export
    }

    pub fn export_mut(&mut self) -> &mut Export {
        &mut self.export
    }

    pub fn published(&self) -> bool {
        self.published
    }

    pub fn set_published(&mut self, published: bool) {
        self.published = published;
    }

    /// Equality ignores `published`: it is node-local state, not catalog
    /// content.
    pub fn is_equal(&self, other: &AdmExport) -> bool {
        self.export == other.export
    }
}

#[derive(Debug)]
pub struct ExportTable {
    exports: Vec<AdmExport>,
    version: u64,
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExportTable {
    pub fn new() -> Self {
        ExportTable {
            exports: Vec::new(),
            version: EXPORTS_VERSION_DEFAULT,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
    }

    /// Only reconciliation adopts a foreign version; it never regresses.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn number(&self) -> usize {
        self.exports.len()
    }

    pub fn get_nth(&self, n: usize) -> Option<&AdmExport> {
        self.exports.get(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AdmExport> {
        self.exports.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AdmExport> {
        self.exports.iter_mut()
    }

    pub fn get_by_uuid(&self, uuid: &ExaUuid) -> Option<&AdmExport> {
        self.exports.iter().find(|e| e.export.uuid() == uuid)
    }

    pub fn get_by_uuid_mut(&mut self, uuid: &ExaUuid) -> Option<&mut AdmExport> {
        self.exports.iter_mut().find(|e| e.export.uuid() == uuid)
    }

    /// Insert a new export. Duplicate UUIDs are refused here rather than
    /// trusted away to callers.
    pub fn insert(&mut self, adm_export: AdmExport) -> Result<(), LumError> {
        if self.get_by_uuid(adm_export.export.uuid()).is_some() {
            return Err(LumError::VolumeAlreadyExported);
        }
        if self.exports.len() >= MAX_EXPORTS {
            return Err(LumError::NoSpace);
        }
        self.exports.push(adm_export);
        Ok(())
    }

    /// Remove in place (shifting); an unknown UUID is only worth a warning.
    pub fn remove_by_uuid(&mut self, uuid: &ExaUuid) {
        match self.exports.iter().position(|e| e.export.uuid() == uuid) {
            Some(pos) => {
                self.exports.remove(pos);
            },
            None => warn!("cannot delete unknown export uuid={uuid}"),
        }
    }

    pub fn clear(&mut self) {
        self.exports.clear();
    }

    /// True iff no iSCSI export occupies the LUN.
    pub fn lun_is_available(&self, lun: Lun) -> bool {
        !self
            .exports
            .iter()
            .any(|e| e.export.iscsi_lun() == Some(lun))
    }

    /// Lowest unused LUN.
    pub fn get_new_lun(&self) -> Result<Lun, LumError> {
        let mut used = [false; MAX_LUNS as usize];
        for e in &self.exports {
            if let Some(lun) = e.export.iscsi_lun() {
                used[lun.index()] = true;
            }
        }
        used.iter()
            .position(|u| !u)
            .map(|i| Lun::new(i as u64).expect("in range"))
            .ok_or(LumError::NoLunAvailable)
    }

    // Per-export mutators. Version bumping and persistence belong to
    // [`super::service::ExportsService`], which wraps them.

    pub fn set_readonly_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        readonly: bool,
    ) -> Result<(), LumError> {
        self.get_by_uuid_mut(uuid)
            .ok_or(LumError::ExportNotFound)?
            .export_mut()
            .set_readonly(readonly);
        Ok(())
    }

    pub fn iscsi_set_lun_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        lun: Lun,
    ) -> Result<(), LumError> {
        {
            let adm = self.get_by_uuid(uuid).ok_or(LumError::ExportNotFound)?;
            if !adm.export().is_iscsi() {
                return Err(LumError::ExportWrongMethod);
            }
            if adm.export().iscsi_lun() == Some(lun) {
                return Err(LumError::LunAlreadyAssigned);
            }
        }
        if !self.lun_is_available(lun) {
            return Err(LumError::LunBusy);
        }
        self.get_by_uuid_mut(uuid)
            .expect("checked above")
            .export_mut()
            .iscsi_set_lun(lun)
    }

    pub fn iscsi_set_filter_policy_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.get_by_uuid_mut(uuid)
            .ok_or(LumError::ExportNotFound)?
            .export_mut()
            .iscsi_set_filter_policy(policy)
    }

    pub fn iscsi_add_iqn_filter_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        pattern: Iqn,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.get_by_uuid_mut(uuid)
            .ok_or(LumError::ExportNotFound)?
            .export_mut()
            .add_iqn_filter(pattern, policy)
    }

    pub fn iscsi_remove_iqn_filter_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        pattern: &Iqn,
    ) -> Result<(), LumError> {
        self.get_by_uuid_mut(uuid)
            .ok_or(LumError::ExportNotFound)?
            .export_mut()
            .remove_iqn_filter(pattern)
    }

    pub fn iscsi_clear_iqn_filters_policy_by_uuid(
        &mut self,
        uuid: &ExaUuid,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.get_by_uuid_mut(uuid)
            .ok_or(LumError::ExportNotFound)?
            .export_mut()
            .clear_iqn_filters_policy(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u32) -> ExaUuid {
        ExaUuid([n, 0, 0, 0])
    }

    fn iscsi(n: u32, lun: u64) -> AdmExport {
        AdmExport::new(Export::new_iscsi(
            uuid(n),
            Lun::new(lun).expect("valid"),
            FilterPolicy::Accept,
        ))
    }

    #[test]
    fn insert_enforces_uuid_uniqueness() {
        let mut table = ExportTable::new();
        table.insert(iscsi(1, 0)).expect("insert");
        assert_eq!(
            table.insert(iscsi(1, 1)),
            Err(LumError::VolumeAlreadyExported)
        );
        assert_eq!(table.number(), 1);
    }

    #[test]
    fn remove_unknown_is_a_noop() {
        let mut table = ExportTable::new();
        table.insert(iscsi(1, 0)).expect("insert");
        table.remove_by_uuid(&uuid(9));
        assert_eq!(table.number(), 1);
        table.remove_by_uuid(&uuid(1));
        assert_eq!(table.number(), 0);
    }

    #[test]
    fn new_lun_is_lowest_free() {
        let mut table = ExportTable::new();
        table.insert(iscsi(1, 0)).expect("insert");
        table.insert(iscsi(2, 1)).expect("insert");
        table.insert(iscsi(3, 3)).expect("insert");
        assert_eq!(table.get_new_lun().expect("free lun").value(), 2);
        assert!(!table.lun_is_available(Lun::new(3).expect("valid")));
        assert!(table.lun_is_available(Lun::new(4).expect("valid")));
    }

    #[test]
    fn set_lun_checks_busy_and_identity() {
        let mut table = ExportTable::new();
        table.insert(iscsi(1, 0)).expect("insert");
        table.insert(iscsi(2, 1)).expect("insert");
        assert_eq!(
            table.iscsi_set_lun_by_uuid(&uuid(1), Lun::new(1).expect("valid")),
            Err(LumError::LunBusy)
        );
        assert_eq!(
            table.iscsi_set_lun_by_uuid(&uuid(1), Lun::new(0).expect("valid")),
            Err(LumError::LunAlreadyAssigned)
        );
        table
            .iscsi_set_lun_by_uuid(&uuid(1), Lun::new(5).expect("valid"))
            .expect("set lun");
        assert_eq!(
            table
                .get_by_uuid(&uuid(1))
                .expect("found")
                .export()
                .iscsi_lun()
                .expect("iscsi")
                .value(),
            5
        );
    }

    #[test]
    fn published_is_not_part_of_equality() {
        let mut a = iscsi(1, 0);
        let b = iscsi(1, 0);
        a.set_published(true);
        assert!(a.is_equal(&b));
    }
}
