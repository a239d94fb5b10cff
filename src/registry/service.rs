// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The admin command surface over the export catalog.
//!
//! Every successful mutation bumps the table version and rewrites the
//! exports file, so the on-disk copy always reflects the last committed
//! version and reconciliation can compare replicas by version alone.

use std::path::Path;

use crate::{
    errors::LumError,
    export::{
        export::Export, iqn::Iqn, iqn_filter::FilterPolicy, lun::Lun, uuid::ExaUuid,
    },
    registry::{
        table::{AdmExport, ExportTable},
        xml::ExportsFile,
    },
};

pub struct ExportsService {
    table: ExportTable,
    file: ExportsFile,
}

impl ExportsService {
    /// Open the catalog in `cache_dir`, loading the persisted copy if any.
    pub fn open(cache_dir: &Path) -> Result<Self, LumError> {
        let file = ExportsFile::new(cache_dir);
        let mut table = ExportTable::new();
        file.load(&mut table)?;
        Ok(ExportsService { table, file })
    }

    pub fn table(&self) -> &ExportTable {
        &self.table
    }

    /// Reconciliation works on the bare table; it does its own persisting.
    pub fn table_mut(&mut self) -> &mut ExportTable {
        &mut self.table
    }

    pub fn file(&self) -> &ExportsFile {
        &self.file
    }

    fn commit(&mut self) -> Result<(), LumError> {
        self.table.increment_version();
        self.file.store(&self.table)
    }

    pub fn create_export(&mut self, export: Export) -> Result<(), LumError> {
        self.table.insert(AdmExport::new(export))?;
        self.commit()
    }

    pub fn delete_export(&mut self, uuid: &ExaUuid) -> Result<(), LumError> {
        self.table.remove_by_uuid(uuid);
        self.commit()
    }

    pub fn set_lun(&mut self, uuid: &ExaUuid, lun: Lun) -> Result<(), LumError> {
        self.table.iscsi_set_lun_by_uuid(uuid, lun)?;
        self.commit()
    }

    pub fn set_filter_policy(
        &mut self,
        uuid: &ExaUuid,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.table.iscsi_set_filter_policy_by_uuid(uuid, policy)?;
        self.commit()
    }

    pub fn add_iqn_filter(
        &mut self,
        uuid: &ExaUuid,
        pattern: Iqn,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.table
            .iscsi_add_iqn_filter_by_uuid(uuid, pattern, policy)?;
        self.commit()
    }

    pub fn remove_iqn_filter(
        &mut self,
        uuid: &ExaUuid,
        pattern: &Iqn,
    ) -> Result<(), LumError> {
        self.table.iscsi_remove_iqn_filter_by_uuid(uuid, pattern)?;
        self.commit()
    }

    pub fn clear_iqn_filters_policy(
        &mut self,
        uuid: &ExaUuid,
        policy: FilterPolicy,
    ) -> Result<(), LumError> {
        self.table
            .iscsi_clear_iqn_filters_policy_by_uuid(uuid, policy)?;
        self.commit()
    }

    pub fn set_readonly(
        &mut self,
        uuid: &ExaUuid,
        readonly: bool,
    ) -> Result<(), LumError> {
        self.table.set_readonly_by_uuid(uuid, readonly)?;
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u32) -> ExaUuid {
        ExaUuid([n, 7, 7, 7])
    }

    fn service() -> (tempfile::TempDir, ExportsService) {
        let dir = tempfile::tempdir().expect("tempdir");
        let svc = ExportsService::open(dir.path()).expect("open");
        (dir, svc)
    }

    #[test]
    fn every_mutation_bumps_the_version_and_persists() {
        let (dir, mut svc) = service();
        assert_eq!(svc.table().version(), 1);

        svc.create_export(Export::new_iscsi(
            uuid(1),
            Lun::new(3).expect("valid"),
            FilterPolicy::Accept,
        ))
        .expect("create");
        assert_eq!(svc.table().version(), 2);

        svc.add_iqn_filter(
            &uuid(1),
            Iqn::new("iqn.2020-01.example:*").expect("valid"),
            FilterPolicy::Reject,
        )
        .expect("add filter");
        assert_eq!(svc.table().version(), 3);

        svc.set_lun(&uuid(1), Lun::new(9).expect("valid"))
            .expect("set lun");
        svc.set_readonly(&uuid(1), true).expect("set readonly");
        assert_eq!(svc.table().version(), 5);

        // a failing mutation commits nothing
        assert_eq!(
            svc.set_lun(&uuid(2), Lun::new(0).expect("valid")),
            Err(LumError::ExportNotFound)
        );
        assert_eq!(svc.table().version(), 5);

        // reopening sees the committed state
        let reopened = ExportsService::open(dir.path()).expect("reopen");
        assert_eq!(reopened.table().version(), 5);
        assert_eq!(reopened.table().number(), 1);
        let adm = reopened.table().get_nth(0).expect("one");
        assert!(adm.export().readonly());
        assert_eq!(adm.export().iscsi_lun().expect("iscsi").value(), 9);
    }

    #[test]
    fn delete_then_lun_reuse() {
        let (_dir, mut svc) = service();
        svc.create_export(Export::new_iscsi(
            uuid(1),
            Lun::new(0).expect("valid"),
            FilterPolicy::Accept,
        ))
        .expect("create");
        svc.create_export(Export::new_iscsi(
            uuid(2),
            Lun::new(1).expect("valid"),
            FilterPolicy::Accept,
        ))
        .expect("create");

        assert_eq!(svc.table().get_new_lun().expect("free").value(), 2);
        svc.delete_export(&uuid(1)).expect("delete");
        assert_eq!(svc.table().get_new_lun().expect("free").value(), 0);
        assert_eq!(svc.table().version(), 4);
    }
}
