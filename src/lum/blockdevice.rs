// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The block-device and volume-store contracts the LUM executive consumes.
//!
//! The storage virtualizer behind these traits is an external collaborator;
//! a RAM-backed implementation ships for the daemon demo and the tests.
//! Contract: exactly one completion per submission; a zero-length FUA write
//! orders every previously completed write before it completes.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

use crate::{errors::LumError, export::uuid::ExaUuid};

pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

/// Delivered exactly once per submission. For reads, `data` carries the
/// bytes; for writes it returns the submitted buffer.
#[derive(Debug)]
pub struct IoCompletion {
    pub result: io::Result<()>,
    pub data: Vec<u8>,
}

pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> u64;

    /// Queue one I/O; the completion arrives on `done`. Submission itself
    /// never blocks.
    fn submit_io(
        &self,
        op: IoOp,
        fua: bool,
        sector: u64,
        nbytes: u32,
        data: Vec<u8>,
        done: oneshot::Sender<IoCompletion>,
    );

    /// Readahead only means something for bdev-style exports.
    fn set_readahead(&self, _sectors: u32) -> Result<(), LumError> {
        Err(LumError::ExportWrongMethod)
    }
}

/// Where volumes come from: opened by UUID with the requested access mode.
pub trait VolumeStore: Send + Sync {
    fn open(
        &self,
        uuid: &ExaUuid,
        access: AccessMode,
    ) -> Result<Arc<dyn BlockDevice>, LumError>;

    fn close(&self, uuid: &ExaUuid);
}

/// Memory-backed block device.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    readahead: Mutex<u32>,
    writable: bool,
}

impl RamDisk {
    pub fn new(sector_count: u64, writable: bool) -> Arc<Self> {
        Arc::new(RamDisk {
            data: Mutex::new(vec![0u8; (sector_count * SECTOR_SIZE) as usize]),
            readahead: Mutex::new(0),
            writable,
        })
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.data.lock().expect("poisoned ramdisk").len() as u64 / SECTOR_SIZE
    }

    fn submit_io(
        &self,
        op: IoOp,
        _fua: bool,
        sector: u64,
        nbytes: u32,
        mut data: Vec<u8>,
        done: oneshot::Sender<IoCompletion>,
    ) {
        let completion = {
            let mut store = self.data.lock().expect("poisoned ramdisk");
            let start = (sector * SECTOR_SIZE) as usize;
            let end = start + nbytes as usize;
            if end > store.len() {
                IoCompletion {
                    result: Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "I/O beyond end of device",
                    )),
                    data,
                }
            } else {
                match op {
                    IoOp::Read => {
                        data.clear();
                        data.extend_from_slice(&store[start..end]);
                        IoCompletion {
                            result: Ok(()),
                            data,
                        }
                    },
                    IoOp::Write => {
                        if !self.writable {
                            IoCompletion {
                                result: Err(io::Error::new(
                                    io::ErrorKind::PermissionDenied,
                                    "device opened read-only",
                                )),
                                data,
                            }
                        } else {
                            // nbytes == 0 is the cache-drain form: RAM is
                            // always ordered, so it completes at once
                            store[start..end].copy_from_slice(&data[..nbytes as usize]);
                            IoCompletion {
                                result: Ok(()),
                                data,
                            }
                        }
                    },
                }
            }
        };
        let _ = done.send(completion);
    }

    fn set_readahead(&self, sectors: u32) -> Result<(), LumError> {
        *self.readahead.lock().expect("poisoned ramdisk") = sectors;
        Ok(())
    }
}

/// Volume store over RAM disks, keyed by UUID.
#[derive(Default)]
pub struct RamVolumeStore {
    volumes: Mutex<HashMap<ExaUuid, Arc<RamDisk>>>,
}

impl RamVolumeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(RamVolumeStore::default())
    }

    pub fn create_volume(&self, uuid: ExaUuid, sector_count: u64) {
        self.volumes
            .lock()
            .expect("poisoned volume store")
            .insert(uuid, RamDisk::new(sector_count, true));
    }
}

impl VolumeStore for RamVolumeStore {
    fn open(
        &self,
        uuid: &ExaUuid,
        _access: AccessMode,
    ) -> Result<Arc<dyn BlockDevice>, LumError> {
        self.volumes
            .lock()
            .expect("poisoned volume store")
            .get(uuid)
            .map(|d| d.clone() as Arc<dyn BlockDevice>)
            .ok_or(LumError::NotFound)
    }

    fn close(&self, _uuid: &ExaUuid) {}
}
