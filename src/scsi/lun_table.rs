// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-LUN command accounting.
//!
//! Every in-flight command for a LUN is registered in its slot; a logical
//! unit reset freezes the slot (new commands park on the waiter queue),
//! aborts the abortable ones and waits for the rest to drain.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{
    errors::LumError,
    export::lun::{Lun, MAX_LUNS},
    lum::executive::LiveExport,
    scsi::cdb,
};

/// Lifecycle of one target command, shared between the session that owns the
/// buffers and the LUN slot that may abort it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CmdState {
    #[default]
    NotStarted,
    ReadNeedRead,
    WriteNeedWrite,
    ReadSuccess,
    ReadFailed,
    WriteSuccess,
    WriteFailed,
    PrSuccess,
    PrFailed,
    Abort,
}

#[derive(Debug)]
pub struct LunCommand {
    pub tag: u32,
    pub opcode: u8,
    state: Mutex<CmdState>,
}

impl LunCommand {
    fn new(tag: u32, opcode: u8) -> Arc<Self> {
        Arc::new(LunCommand {
            tag,
            opcode,
            state: Mutex::new(CmdState::NotStarted),
        })
    }

    pub fn state(&self) -> CmdState {
        *self.state.lock().expect("poisoned command state")
    }

    pub fn set_state(&self, st: CmdState) {
        *self.state.lock().expect("poisoned command state") = st;
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == CmdState::Abort
    }
}

#[derive(Default)]
struct SlotInner {
    serial: String,
    export: Option<Arc<LiveExport>>,
    sector_count: u64,
    readonly: bool,
    in_progress: u32,
    reset_waiters: u32,
    commands: HashMap<u32, Arc<LunCommand>>,
}

pub struct LunSlot {
    inner: Mutex<SlotInner>,
    /// Woken when a frozen slot thaws.
    waiters: Notify,
    /// Woken when `in_progress` drains to zero.
    drained: Notify,
}

impl LunSlot {
    fn new() -> Self {
        LunSlot {
            inner: Mutex::new(SlotInner::default()),
            waiters: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().expect("poisoned LUN slot")
    }
}

pub struct LunTable {
    slots: Vec<LunSlot>,
}

impl Default for LunTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LunTable {
    pub fn new() -> Self {
        LunTable {
            slots: (0..MAX_LUNS).map(|_| LunSlot::new()).collect(),
        }
    }

    fn slot(&self, lun: Lun) -> &LunSlot {
        &self.slots[lun.index()]
    }

    /// A LUN is defined iff an export with a non-zero size sits behind it.
    pub fn is_defined(&self, lun: Lun) -> bool {
        self.sector_count(lun) > 0
    }

    pub fn sector_count(&self, lun: Lun) -> u64 {
        self.slot(lun).lock().sector_count
    }

    pub fn serial(&self, lun: Lun) -> String {
        self.slot(lun).lock().serial.clone()
    }

    pub fn readonly(&self, lun: Lun) -> bool {
        self.slot(lun).lock().readonly
    }

    pub fn export(&self, lun: Lun) -> Option<Arc<LiveExport>> {
        self.slot(lun).lock().export.clone()
    }

    /// Install an export behind a LUN. The serial is the export UUID string.
    pub fn install_export(
        &self,
        lun: Lun,
        export: Arc<LiveExport>,
        sector_count: u64,
        readonly: bool,
    ) {
        let mut g = self.slot(lun).lock();
        assert!(g.export.is_none(), "LUN {lun} already bound to an export");
        g.serial = export.uuid().to_string();
        g.export = Some(export);
        g.sector_count = sector_count;
        g.readonly = readonly;
    }

    /// Unbind the export. Fails when commands are still linked to the slot.
    pub fn remove_export(&self, lun: Lun) -> Result<(), LumError> {
        let mut g = self.slot(lun).lock();
        if g.export.is_none() {
            warn!("LUN {lun} removal: no export installed");
            return Err(LumError::NotFound);
        }
        if !g.commands.is_empty() {
            return Err(LumError::VolumeIsInUse);
        }
        g.serial.clear();
        g.export = None;
        g.sector_count = 0;
        g.readonly = false;
        Ok(())
    }

    pub fn in_use(&self, lun: Lun) -> bool {
        !self.slot(lun).lock().commands.is_empty()
    }

    /// Update the size; returns true when the value actually changed.
    pub fn set_sector_count(&self, lun: Lun, sector_count: u64) -> bool {
        let mut g = self.slot(lun).lock();
        let changed = g.sector_count != sector_count;
        g.sector_count = sector_count;
        changed
    }

    pub fn find_lun_of_export(&self, uuid_str: &str) -> Option<Lun> {
        for (i, slot) in self.slots.iter().enumerate() {
            let g = slot.lock();
            if g.export.is_some() && g.serial == uuid_str {
                return Lun::new(i as u64).ok();
            }
        }
        None
    }

    /// Admit a command: parks while a reset drains the slot, then links the
    /// command and bumps `in_progress`.
    pub async fn begin_command(&self, lun: Lun, tag: u32, opcode: u8) -> Arc<LunCommand> {
        let slot = self.slot(lun);
        loop {
            // register before the check so a wakeup between the two cannot
            // be missed
            let parked = slot.waiters.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            {
                let mut g = slot.lock();
                if g.reset_waiters == 0 {
                    g.in_progress += 1;
                    let cmd = LunCommand::new(tag, opcode);
                    g.commands.insert(tag, cmd.clone());
                    return cmd;
                }
            }
            parked.await;
        }
    }

    /// Retire a command. Aborted commands already gave their `in_progress`
    /// count back during the reset scan.
    pub fn end_command(&self, lun: Lun, cmd: &LunCommand) {
        let slot = self.slot(lun);
        let mut g = slot.lock();
        if cmd.state() != CmdState::Abort {
            g.in_progress = g
                .in_progress
                .checked_sub(1)
                .expect("in_progress underflow");
        }
        g.commands.remove(&cmd.tag);
        if g.in_progress == 0 {
            slot.drained.notify_waiters();
            slot.waiters.notify_waiters();
        }
    }

    pub fn command_by_tag(&self, lun: Lun, tag: u32) -> Option<Arc<LunCommand>> {
        self.slot(lun).lock().commands.get(&tag).cloned()
    }

    /// Local half of a logical unit reset: mark the abortable commands
    /// (reservation-changing ones; reads and writes ride the block layer and
    /// cannot be cancelled), then wait for the rest to finish.
    ///
    /// Returns once no admitted command remains in flight. SPC-2 reservation
    /// cleanup and the UNIT ATTENTION broadcast are the caller's business.
    pub async fn local_logical_unit_reset(&self, lun: Lun) {
        let slot = self.slot(lun);
        let need_wait = {
            let mut g = slot.lock();
            let mut aborted = 0u32;
            for cmd in g.commands.values() {
                if cmd.state() != CmdState::Abort
                    && cdb::is_reservation_opcode(cmd.opcode)
                {
                    info!(
                        "SCSI: ABORT command tag {:#x} type {:#04x}",
                        cmd.tag, cmd.opcode
                    );
                    cmd.set_state(CmdState::Abort);
                    aborted += 1;
                }
            }
            g.in_progress = g
                .in_progress
                .checked_sub(aborted)
                .expect("in_progress underflow during reset");
            let wait = g.in_progress != 0;
            if wait {
                g.reset_waiters += 1;
            }
            wait
        };

        if need_wait {
            loop {
                let drained = slot.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if slot.lock().in_progress == 0 {
                    break;
                }
                drained.await;
            }
            slot.lock().reset_waiters -= 1;
            slot.waiters.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scsi::cdb::op;

    fn lun(v: u64) -> Lun {
        Lun::new(v).expect("valid LUN")
    }

    #[tokio::test]
    async fn begin_end_counts() {
        let table = LunTable::new();
        let cmd = table.begin_command(lun(0), 1, op::READ_10).await;
        assert!(table.in_use(lun(0)));
        table.end_command(lun(0), &cmd);
        assert!(!table.in_use(lun(0)));
    }

    #[tokio::test]
    async fn reset_aborts_reservation_commands() {
        let table = Arc::new(LunTable::new());
        let pr = table.begin_command(lun(3), 7, op::PERSISTENT_RESERVE_OUT).await;

        // only the abortable PR command is outstanding: reset returns at once
        table.local_logical_unit_reset(lun(3)).await;
        assert_eq!(pr.state(), CmdState::Abort);

        // the completion path still retires the aborted command
        table.end_command(lun(3), &pr);
        assert!(!table.in_use(lun(3)));
    }

    #[tokio::test]
    async fn reset_waits_for_inflight_io_and_blocks_new_commands() {
        let table = Arc::new(LunTable::new());
        let io = table.begin_command(lun(1), 9, op::WRITE_10).await;

        let t2 = table.clone();
        let reset = tokio::spawn(async move {
            t2.local_logical_unit_reset(lun(1)).await;
        });

        // give the reset a chance to park
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reset.is_finished());

        // a newcomer must stay parked while the reset is pending
        let t3 = table.clone();
        let newcomer = tokio::spawn(async move {
            let cmd = t3.begin_command(lun(1), 10, op::READ_10).await;
            t3.end_command(lun(1), &cmd);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!newcomer.is_finished());

        // draining the write releases the reset, then the newcomer
        table.end_command(lun(1), &io);
        tokio::time::timeout(Duration::from_secs(1), reset)
            .await
            .expect("reset must finish")
            .expect("join");
        tokio::time::timeout(Duration::from_secs(1), newcomer)
            .await
            .expect("newcomer must finish")
            .expect("join");
    }
}
