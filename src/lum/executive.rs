// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The LUM executive: live exports on this node.
//!
//! A live export binds one export description to an open block device and a
//! target adapter. The registry owns the authoritative descriptions; what
//! lives here is the node-local materialization.

use std::sync::{Arc, Mutex, RwLock};

use tracing::error;

use crate::{
    errors::LumError,
    export::{export::Export, iqn::Iqn, uuid::ExaUuid},
    lum::blockdevice::{AccessMode, BlockDevice, SECTOR_SIZE, VolumeStore},
};

/// One export materialized on this node.
pub struct LiveExport {
    desc: RwLock<Export>,
    device: Arc<dyn BlockDevice>,
}

impl LiveExport {
    pub fn uuid(&self) -> ExaUuid {
        *self.desc().uuid()
    }

    pub fn desc(&self) -> std::sync::RwLockReadGuard<'_, Export> {
        self.desc.read().expect("poisoned live export")
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn readonly(&self) -> bool {
        self.desc().readonly()
    }

    /// Effective filter policy for an initiator, from the live description.
    pub fn policy_for_iqn(&self, iqn: &Iqn) -> crate::export::iqn_filter::FilterPolicy {
        self.desc().policy_for_iqn(iqn)
    }
}

/// The target side the executive signals into (the iSCSI adapter, and the
/// bdev adapter for local block devices).
pub trait TargetAdapter: Send + Sync {
    fn signal_new_export(
        &self,
        live: &Arc<LiveExport>,
        sector_count: u64,
    ) -> Result<(), LumError>;

    fn signal_remove_export(&self, live: &Arc<LiveExport>) -> Result<(), LumError>;

    fn signal_update_iqn_filters(&self, live: &Arc<LiveExport>);

    fn export_set_size(&self, live: &Arc<LiveExport>, sector_count: u64);

    fn export_in_use(&self, live: &Arc<LiveExport>) -> bool;

    fn set_readahead(
        &self,
        live: &Arc<LiveExport>,
        readahead_sectors: u32,
    ) -> Result<(), LumError>;
}

/// Answer to `get_info` queries from the admin layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LumExportInfo {
    pub readonly: bool,
    pub in_use: bool,
}

pub struct LumExecutive {
    exports: Mutex<Vec<Arc<LiveExport>>>,
    store: Arc<dyn VolumeStore>,
    iscsi_adapter: Arc<dyn TargetAdapter>,
    bdev_adapter: Arc<dyn TargetAdapter>,
}

impl LumExecutive {
    pub fn new(
        store: Arc<dyn VolumeStore>,
        iscsi_adapter: Arc<dyn TargetAdapter>,
        bdev_adapter: Arc<dyn TargetAdapter>,
    ) -> Arc<Self> {
        Arc::new(LumExecutive {
            exports: Mutex::new(Vec::new()),
            store,
            iscsi_adapter,
            bdev_adapter,
        })
    }

    fn lock_exports(&self) -> std::sync::MutexGuard<'_, Vec<Arc<LiveExport>>> {
        self.exports.lock().expect("poisoned executive export list")
    }

    fn find_by_uuid(&self, uuid: &ExaUuid) -> Option<Arc<LiveExport>> {
        self.lock_exports()
            .iter()
            .find(|e| e.uuid() == *uuid)
            .cloned()
    }

    fn adapter_for(&self, export: &Export) -> &Arc<dyn TargetAdapter> {
        if export.is_iscsi() {
            &self.iscsi_adapter
        } else {
            &self.bdev_adapter
        }
    }

    /// Materialize an export from its serialized description: open the
    /// volume, register with the adapter, announce the new LUN. Rolls back
    /// in reverse order on any failure.
    pub fn export(&self, buf: &[u8]) -> Result<(), LumError> {
        let desc = Export::deserialize(buf)?;
        let uuid = *desc.uuid();

        if self.find_by_uuid(&uuid).is_some() {
            return Err(LumError::VolumeAlreadyExported);
        }

        let access = if desc.readonly() {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let device = self.store.open(&uuid, access).map_err(|e| {
            error!("failed opening volume {uuid}: {e}");
            e
        })?;
        let sector_count = device.sector_count();

        let live = Arc::new(LiveExport {
            desc: RwLock::new(desc),
            device,
        });

        self.lock_exports().push(live.clone());

        let adapter = self.adapter_for(&live.desc()).clone();
        if let Err(e) = adapter.signal_new_export(&live, sector_count) {
            // roll back: unlink, close the volume
            self.lock_exports().retain(|e2| e2.uuid() != uuid);
            self.store.close(&uuid);
            return Err(e);
        }

        Ok(())
    }

    /// Tear an export down; refuses while the LUN is serving commands.
    pub fn unexport(&self, uuid: &ExaUuid) -> Result<(), LumError> {
        let live = self
            .find_by_uuid(uuid)
            .ok_or(LumError::VolumeNotExported)?;

        let adapter = self.adapter_for(&live.desc()).clone();
        adapter.signal_remove_export(&live)?;

        self.store.close(uuid);
        self.lock_exports().retain(|e| e.uuid() != *uuid);
        Ok(())
    }

    /// Adopt a new filter list (and default policy) from a serialized
    /// description of the same export.
    pub fn update_iqn_filters(&self, buf: &[u8]) -> Result<(), LumError> {
        let new_desc = Export::deserialize(buf)?;
        let live = self
            .find_by_uuid(new_desc.uuid())
            .ok_or(LumError::VolumeNotExported)?;

        {
            let mut desc = live.desc.write().expect("poisoned live export");
            if !desc.is_iscsi() {
                return Err(LumError::ExportWrongMethod);
            }
            desc.copy_iqn_filters(&new_desc)?;
        }

        self.adapter_for(&live.desc())
            .signal_update_iqn_filters(&live);
        Ok(())
    }

    /// Propagate a volume resize; the adapter raises CAPACITY DATA HAS
    /// CHANGED only when the size really moved.
    pub fn resize(&self, uuid: &ExaUuid, new_size_kib: u64) -> Result<(), LumError> {
        let live = self
            .find_by_uuid(uuid)
            .ok_or(LumError::VolumeNotExported)?;
        let sector_count = new_size_kib * 1024 / SECTOR_SIZE;
        self.adapter_for(&live.desc())
            .export_set_size(&live, sector_count);
        Ok(())
    }

    pub fn set_readahead(
        &self,
        uuid: &ExaUuid,
        readahead_sectors: u32,
    ) -> Result<(), LumError> {
        let live = self
            .find_by_uuid(uuid)
            .ok_or(LumError::VolumeNotExported)?;
        if !live.desc().is_bdev() {
            return Err(LumError::ExportWrongMethod);
        }
        self.adapter_for(&live.desc())
            .set_readahead(&live, readahead_sectors)
    }

    pub fn get_info(&self, uuid: &ExaUuid) -> Result<LumExportInfo, LumError> {
        let live = self
            .find_by_uuid(uuid)
            .ok_or(LumError::VolumeNotExported)?;
        Ok(LumExportInfo {
            readonly: live.readonly(),
            in_use: self.adapter_for(&live.desc()).export_in_use(&live),
        })
    }

    pub fn exported_uuids(&self) -> Vec<ExaUuid> {
        self.lock_exports().iter().map(|e| e.uuid()).collect()
    }
}

/// Adapter for exports presented as local block devices. The device node
/// management itself belongs to the platform layer; what matters here is
/// readahead pass-through and the in-use answer.
#[derive(Default)]
pub struct BdevAdapter;

impl BdevAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(BdevAdapter)
    }
}

impl TargetAdapter for BdevAdapter {
    fn signal_new_export(
        &self,
        _live: &Arc<LiveExport>,
        _sector_count: u64,
    ) -> Result<(), LumError> {
        Ok(())
    }

    fn signal_remove_export(&self, _live: &Arc<LiveExport>) -> Result<(), LumError> {
        Ok(())
    }

    fn signal_update_iqn_filters(&self, _live: &Arc<LiveExport>) {}

    fn export_set_size(&self, _live: &Arc<LiveExport>, _sector_count: u64) {}

    fn export_in_use(&self, _live: &Arc<LiveExport>) -> bool {
        false
    }

    fn set_readahead(
        &self,
        live: &Arc<LiveExport>,
        readahead_sectors: u32,
    ) -> Result<(), LumError> {
        live.device().set_readahead(readahead_sectors)
    }
}
