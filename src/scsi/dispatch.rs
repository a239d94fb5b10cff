// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The SCSI command core: validates the addressed LUN, consults the
//! reservation engine, and executes or forwards each CDB.

use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::{
    cluster::{
        algo::{PrApplier, PrEngineHandle},
        event::{ClusterEvent, GlobalSessionId, global_session_id},
        node::NodeId,
        pr::{PrContext, PrStatus},
    },
    export::{
        export::Export,
        lun::{Lun, MAX_LUNS},
    },
    lum::blockdevice::IoOp,
    scsi::{
        cdb::{self, op},
        inquiry::{self, InquiryEnv},
        lun_table::{CmdState, LunCommand, LunTable},
        mode_sense::{self, ModeSenseEnv},
        report_luns,
        sense::{CommandStatus, SENSE_LEN, asc, build_sense, key},
    },
};

/// What the SCSI layer needs from the transport above it.
pub trait ScsiTransport: Send + Sync + 'static {
    /// An export (re)appeared or changed its filters: recompute every
    /// logged-in session's authorized LUNs.
    fn update_lun_access_authorizations(&self, export: &Export);

    /// Push a unit attention to one local session.
    fn async_event(&self, local_session_id: usize, lun: Lun, sense: [u8; SENSE_LEN]);

    /// Push a unit attention to every logged-in local session.
    fn async_event_all_sessions(&self, lun: Lun, sense: [u8; SENSE_LEN]);
}

/// Identity of the session issuing a command.
pub struct CommandEnv<'a> {
    pub local_session_id: usize,
    pub tag: u32,
    pub authorized: &'a (dyn Fn(Lun) -> bool + Sync),
}

pub struct ScsiCore {
    pub luns: LunTable,
    pub reservations: Mutex<PrContext>,
    pr_engine: OnceCell<PrEngineHandle>,
    transport: OnceCell<Arc<dyn ScsiTransport>>,
    pub node_id: NodeId,
    pub buffer_size: u32,
}

impl ScsiCore {
    pub fn new(node_id: NodeId, buffer_size: u32) -> Arc<Self> {
        Arc::new(ScsiCore {
            luns: LunTable::new(),
            reservations: Mutex::new(PrContext::new()),
            pr_engine: OnceCell::new(),
            transport: OnceCell::new(),
            node_id,
            buffer_size,
        })
    }

    pub fn bind_pr_engine(&self, handle: PrEngineHandle) {
        self.pr_engine
            .set(handle)
            .unwrap_or_else(|_| panic!("PR engine bound twice"));
    }

    pub fn bind_transport(&self, transport: Arc<dyn ScsiTransport>) {
        if self.transport.set(transport).is_err() {
            panic!("SCSI transport bound twice");
        }
    }

    fn engine(&self) -> &PrEngineHandle {
        self.pr_engine.get().expect("PR engine not bound")
    }

    pub fn transport(&self) -> &Arc<dyn ScsiTransport> {
        self.transport.get().expect("SCSI transport not bound")
    }

    pub fn gsid(&self, local_session_id: usize) -> GlobalSessionId {
        global_session_id(local_session_id, self.node_id)
    }

    /// A local session reached full feature; cluster-order the fact before
    /// the session goes live.
    pub async fn new_session(&self, local_session_id: usize) {
        let gsid = self.gsid(local_session_id);
        self.engine()
            .submit(ClusterEvent::NewSession { gsid })
            .await;
    }

    pub async fn del_session(&self, local_session_id: usize) {
        let gsid = self.gsid(local_session_id);
        self.engine()
            .submit(ClusterEvent::DelSession { gsid })
            .await;
    }

    /// Cluster-ordered logical unit reset; `None` resets every LUN.
    pub async fn logical_unit_reset(&self, lun: Option<Lun>) {
        self.engine()
            .submit(ClusterEvent::LogicalUnitReset { lun })
            .await;
    }

    async fn reset_one_lun(&self, lun: Lun) {
        self.luns.local_logical_unit_reset(lun).await;
        self.reservations
            .lock()
            .expect("poisoned PR context")
            .reset_lun_reservation(lun);
        // every local nexus learns the world changed under it
        self.transport().async_event_all_sessions(
            lun,
            build_sense(key::UNIT_ATTENTION, asc::BUS_DEVICE_RESET_FUNCTION_OCCURRED),
        );
    }
}

impl PrApplier for ScsiCore {
    async fn apply_event(&self, event: ClusterEvent) -> PrStatus {
        match event {
            ClusterEvent::ReserveOut { lun, gsid, payload } => {
                let mut cdb_bytes = [0u8; 16];
                cdb_bytes.copy_from_slice(&payload[..16]);
                self.reservations
                    .lock()
                    .expect("poisoned PR context")
                    .reserve_out(lun, &cdb_bytes, &payload[16..], gsid)
            },
            ClusterEvent::NewSession { gsid } => {
                self.reservations
                    .lock()
                    .expect("poisoned PR context")
                    .add_session(gsid);
                PrStatus::Good
            },
            ClusterEvent::DelSession { gsid } => {
                self.reservations
                    .lock()
                    .expect("poisoned PR context")
                    .del_session(gsid);
                PrStatus::Good
            },
            ClusterEvent::LogicalUnitReset { lun } => {
                match lun {
                    Some(lun) => self.reset_one_lun(lun).await,
                    None => {
                        for v in 0..MAX_LUNS {
                            self.reset_one_lun(Lun::new(v).expect("in range")).await;
                        }
                    },
                }
                PrStatus::Good
            },
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.reservations
            .lock()
            .expect("poisoned PR context")
            .pack()
    }

    fn install_snapshot(&self, data: &[u8]) {
        // a replica sent us an unparsable context: the cluster is corrupt
        let ctx = PrContext::unpack(data).expect("corrupt replicated PR context");
        *self.reservations.lock().expect("poisoned PR context") = ctx;
    }
}

/// Execute one CDB for a session. `data_out` is the collected write payload
/// (or the PR-OUT parameter list); the returned status carries the Data-In
/// bytes or the sense block.
pub async fn execute_command(
    core: &ScsiCore,
    env: &CommandEnv<'_>,
    lun_field: u64,
    cdb_bytes: [u8; 16],
    data_out: &[u8],
) -> CommandStatus {
    let lun_raw = lun_field >> 48;
    let opcode = cdb_bytes[0];

    let Ok(lun) = Lun::new(lun_raw) else {
        // out-of-range LUN: only INQUIRY still answers (target probing)
        if opcode == op::INQUIRY {
            return inquiry::inquiry(
                &InquiryEnv {
                    lun_raw,
                    defined: false,
                    authorized: false,
                    serial: "",
                    buffer_size: core.buffer_size,
                },
                &cdb_bytes,
            );
        }
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::LOGICAL_UNIT_NOT_SUPPORTED,
        );
    };

    let cmd = core.luns.begin_command(lun, env.tag, opcode).await;
    let status = dispatch(core, env, lun, &cmd, cdb_bytes, data_out).await;
    core.luns.end_command(lun, &cmd);
    status
}

async fn dispatch(
    core: &ScsiCore,
    env: &CommandEnv<'_>,
    lun: Lun,
    cmd: &Arc<LunCommand>,
    cdb_bytes: [u8; 16],
    data_out: &[u8],
) -> CommandStatus {
    let opcode = cdb_bytes[0];
    let gsid = core.gsid(env.local_session_id);
    let defined = core.luns.is_defined(lun);
    let authorized = (env.authorized)(lun);

    // INQUIRY always answers; REPORT LUNS answers on LUN 0
    if opcode == op::INQUIRY {
        let serial = core.luns.serial(lun);
        return inquiry::inquiry(
            &InquiryEnv {
                lun_raw: lun.value(),
                defined,
                authorized,
                serial: &serial,
                buffer_size: core.buffer_size,
            },
            &cdb_bytes,
        );
    }
    if opcode == op::REPORT_LUNS && lun.value() == 0 {
        return report_luns::report_luns(&cdb_bytes, |l| {
            core.luns.is_defined(l) && (env.authorized)(l)
        });
    }

    if !defined || !authorized {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::LOGICAL_UNIT_NOT_SUPPORTED,
        );
    }

    {
        let reservations = core.reservations.lock().expect("poisoned PR context");
        if !reservations.check_rights(lun, &cdb_bytes, gsid) {
            return CommandStatus::reservation_conflict();
        }
    }

    match opcode {
        op::TEST_UNIT_READY | op::VERIFY_6 | op::VERIFY_10 | op::VERIFY_16 => {
            CommandStatus::good_empty()
        },

        op::REQUEST_SENSE
        | op::MODE_SELECT_6
        | op::MODE_SELECT_10
        | op::RESERVE_10
        | op::RELEASE_10 => CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::INVALID_COMMAND_OPERATION_CODE,
        ),

        op::PERSISTENT_RESERVE_OUT | op::RESERVE_6 | op::RELEASE_6 => {
            let event = ClusterEvent::reserve_out(lun, gsid, &cdb_bytes, data_out);
            let pr_status = core.engine().submit(event).await;

            // aborted by a concurrent LU reset: reclaim resources, say
            // nothing to the initiator (TAS is 0)
            if cmd.is_aborted() {
                info!("SCSI tag {:#x} cdb <{opcode:#04x}> ABORTED", env.tag);
                return CommandStatus::task_aborted();
            }
            cmd.set_state(match pr_status {
                PrStatus::Good => CmdState::PrSuccess,
                _ => CmdState::PrFailed,
            });
            pr_status.into()
        },

        op::PERSISTENT_RESERVE_IN => core
            .reservations
            .lock()
            .expect("poisoned PR context")
            .reserve_in(lun, &cdb_bytes, gsid),

        op::MODE_SENSE_6 | op::MODE_SENSE_10 => mode_sense::mode_sense(
            &ModeSenseEnv {
                sector_count: core.luns.sector_count(lun),
                readonly: core.luns.readonly(lun),
                buffer_size: core.buffer_size,
            },
            &cdb_bytes,
        ),

        op::READ_CAPACITY => {
            let sectors = core.luns.sector_count(lun);
            let mut data = vec![0u8; 8];
            let last = if sectors > 0xFFFF_FFFF {
                0xFFFF_FFFFu32
            } else {
                (sectors - 1) as u32
            };
            data[0..4].copy_from_slice(&last.to_be_bytes());
            data[4..8].copy_from_slice(&512u32.to_be_bytes());
            CommandStatus::good(data)
        },

        op::SERVICE_ACTION_IN_16 => {
            if cdb_bytes[1] & 0x1F == cdb::READ_CAPACITY_16 {
                let sectors = core.luns.sector_count(lun);
                let mut data = vec![0u8; 32];
                data[0..8].copy_from_slice(&(sectors - 1).to_be_bytes());
                data[8..12].copy_from_slice(&512u32.to_be_bytes());
                let alloc = u32::from_be_bytes([
                    cdb_bytes[10],
                    cdb_bytes[11],
                    cdb_bytes[12],
                    cdb_bytes[13],
                ]) as usize;
                data.truncate(alloc.min(32));
                CommandStatus::good(data)
            } else {
                error!(
                    "unknown SERVICE ACTION IN {:#04x} (lun {lun})",
                    cdb_bytes[1] & 0x1F
                );
                CommandStatus::check_condition(
                    key::ILLEGAL_REQUEST,
                    asc::INVALID_COMMAND_OPERATION_CODE,
                )
            }
        },

        op::SYNCHRONIZE_CACHE_10 | op::SYNCHRONIZE_CACHE_16 => {
            // a zero-length FUA write: the device contract orders all prior
            // writes before completing it
            cmd.set_state(CmdState::WriteNeedWrite);
            disk_write(core, lun, cmd, 0, 0, true, Vec::new()).await
        },

        op::READ_6 | op::READ_10 | op::READ_12 | op::READ_16 => {
            let (lba, blocks) = cdb::read_lba_len(&cdb_bytes).expect("read opcode");
            disk_read(core, lun, cmd, lba, blocks).await
        },

        op::WRITE_6 | op::WRITE_10 | op::WRITE_12 | op::WRITE_16 => {
            let (lba, blocks, _fua) =
                cdb::write_lba_len(&cdb_bytes).expect("write opcode");
            // FUA is accepted but not honored; SYNCHRONIZE CACHE drains
            if core.luns.sector_count(lun) < lba + blocks as u64 {
                return CommandStatus::check_condition(
                    key::ILLEGAL_REQUEST,
                    asc::LOGICAL_ADDRESS_OUT_OF_RANGE,
                );
            }
            cmd.set_state(CmdState::WriteNeedWrite);
            disk_write(
                core,
                lun,
                cmd,
                lba,
                blocks * 512,
                false,
                data_out.to_vec(),
            )
            .await
        },

        _ => CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::INVALID_COMMAND_OPERATION_CODE,
        ),
    }
}

async fn disk_read(
    core: &ScsiCore,
    lun: Lun,
    cmd: &Arc<LunCommand>,
    lba: u64,
    blocks: u32,
) -> CommandStatus {
    if core.luns.sector_count(lun) < lba + blocks as u64 {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::LOGICAL_ADDRESS_OUT_OF_RANGE,
        );
    }
    let Some(live) = core.luns.export(lun) else {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::LOGICAL_UNIT_NOT_SUPPORTED,
        );
    };

    cmd.set_state(CmdState::ReadNeedRead);
    let (tx, rx) = oneshot::channel();
    live.device()
        .submit_io(IoOp::Read, false, lba, blocks * 512, Vec::new(), tx);

    match rx.await {
        Ok(done) if done.result.is_ok() => {
            cmd.set_state(CmdState::ReadSuccess);
            CommandStatus::good(done.data)
        },
        other => {
            cmd.set_state(CmdState::ReadFailed);
            if let Ok(done) = other {
                error!("read LUN {lun} lba {lba}: {:?}", done.result);
            }
            CommandStatus::check_condition(
                key::MEDIUM_ERROR,
                asc::UNRECOVERED_READ_ERROR,
            )
        },
    }
}

async fn disk_write(
    core: &ScsiCore,
    lun: Lun,
    cmd: &Arc<LunCommand>,
    lba: u64,
    nbytes: u32,
    fua: bool,
    data: Vec<u8>,
) -> CommandStatus {
    let Some(live) = core.luns.export(lun) else {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::LOGICAL_UNIT_NOT_SUPPORTED,
        );
    };

    let (tx, rx) = oneshot::channel();
    live.device().submit_io(IoOp::Write, fua, lba, nbytes, data, tx);

    match rx.await {
        Ok(done) if done.result.is_ok() => {
            cmd.set_state(CmdState::WriteSuccess);
            CommandStatus::good_empty()
        },
        other => {
            cmd.set_state(CmdState::WriteFailed);
            if let Ok(done) = other {
                error!("write LUN {lun} lba {lba}: {:?}", done.result);
            }
            CommandStatus::check_condition(key::MEDIUM_ERROR, asc::WRITE_ERROR)
        },
    }
}
