// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The target context: the session pool, LUN authorization state, and the
//! adapter surface the LUM executive drives.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use tokio::io::AsyncWrite;
use tracing::{error, warn};

use crate::{
    cfg::config::MAX_SESSIONS,
    errors::LumError,
    export::{
        export::Export,
        iqn::Iqn,
        lun::{Lun, MAX_LUNS},
    },
    lum::executive::{LiveExport, TargetAdapter},
    models::{
        async_message::response::{AsyncEventKind, AsyncMessageBuilder},
        common::BasicHeaderSegment,
    },
    scsi::{
        dispatch::{ScsiCore, ScsiTransport},
        sense::{SENSE_LEN, asc, build_sense, key},
    },
    target::connection::PduWriter,
};

/// Sequence-number state of one session, protected by the state lock.
#[derive(Debug, Default)]
pub struct SeqNumbers {
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub cmd_pending: u32,
}

/// The shared half of a session: what response builders, async events and
/// the authorization recompute need. The PDU loop itself owns the read side.
pub struct SessionHandle {
    pub id: usize,
    queue_depth: u32,
    sn: Mutex<SeqNumbers>,
    pub writer: PduWriter,
    pub logged_in: AtomicBool,
    pub full_feature: AtomicBool,
    authorized: Mutex<[bool; MAX_LUNS as usize]>,
    initiator: Mutex<Option<Iqn>>,
}

impl SessionHandle {
    fn new(id: usize, queue_depth: u32, writer: PduWriter) -> Arc<Self> {
        Arc::new(SessionHandle {
            id,
            queue_depth,
            sn: Mutex::new(SeqNumbers::default()),
            writer,
            logged_in: AtomicBool::new(false),
            full_feature: AtomicBool::new(false),
            authorized: Mutex::new([false; MAX_LUNS as usize]),
            initiator: Mutex::new(None),
        })
    }

    fn sn_lock(&self) -> std::sync::MutexGuard<'_, SeqNumbers> {
        self.sn.lock().expect("poisoned session sequence numbers")
    }

    /// Account an incoming CmdSN/ExpStatSN pair. Non-immediate commands
    /// advance ExpCmdSN past the CmdSN; immediate ones do not.
    pub fn note_cmd_sn(&self, cmd_sn: u32, exp_stat_sn: u32, advance: bool) {
        let mut g = self.sn_lock();
        if g.stat_sn.wrapping_add(1) < exp_stat_sn {
            if g.stat_sn != 0 {
                warn!(
                    "iSCSI: StatSN {} ExpStatSN {} so reset ExpStatSN",
                    g.stat_sn, exp_stat_sn
                );
            }
            // StatSN == 0: the initiator seeds our StatSN at login
            g.stat_sn = exp_stat_sn.wrapping_sub(1);
        }
        if cmd_sn > g.exp_cmd_sn && g.exp_cmd_sn != 0 {
            warn!(
                "iSCSI: CmdSN {} ExpCmdSN {} so reset ExpCmdSN",
                cmd_sn, g.exp_cmd_sn
            );
        }
        let floor = if advance { cmd_sn.wrapping_add(1) } else { cmd_sn };
        g.exp_cmd_sn = floor.max(g.exp_cmd_sn);
        g.max_cmd_sn = Self::window(&g, self.queue_depth);
    }

    /// `MaxCmdSN = ExpCmdSN - 1 + queue_depth - cmd_pending`, recomputed
    /// just before each response.
    fn window(g: &SeqNumbers, queue_depth: u32) -> u32 {
        g.exp_cmd_sn
            .wrapping_sub(1)
            .wrapping_add(queue_depth)
            .wrapping_sub(g.cmd_pending)
    }

    /// Window for a response that carries no new status.
    pub fn stat_sn(&self) -> (u32, u32, u32) {
        let mut g = self.sn_lock();
        g.max_cmd_sn = Self::window(&g, self.queue_depth);
        (g.stat_sn, g.exp_cmd_sn, g.max_cmd_sn)
    }

    /// Window for a status-bearing response: StatSN advances.
    pub fn next_stat_sn(&self) -> (u32, u32, u32) {
        let mut g = self.sn_lock();
        g.max_cmd_sn = Self::window(&g, self.queue_depth);
        g.stat_sn = g.stat_sn.wrapping_add(1);
        (g.stat_sn, g.exp_cmd_sn, g.max_cmd_sn)
    }

    /// Logout responses close the window: MaxCmdSN = ExpCmdSN - 1.
    pub fn next_stat_sn_logout(&self) -> (u32, u32, u32) {
        let mut g = self.sn_lock();
        g.max_cmd_sn = g.exp_cmd_sn.wrapping_sub(1);
        g.stat_sn = g.stat_sn.wrapping_add(1);
        (g.stat_sn, g.exp_cmd_sn, g.max_cmd_sn)
    }

    pub fn inc_pending(&self) {
        self.sn_lock().cmd_pending += 1;
    }

    pub fn dec_pending(&self) {
        let mut g = self.sn_lock();
        g.cmd_pending = g.cmd_pending.saturating_sub(1);
    }

    pub fn pending(&self) -> u32 {
        self.sn_lock().cmd_pending
    }

    pub fn is_authorized(&self, lun: Lun) -> bool {
        self.authorized.lock().expect("poisoned authorized luns")[lun.index()]
    }

    pub fn set_authorized(&self, lun: Lun, allowed: bool) {
        self.authorized.lock().expect("poisoned authorized luns")[lun.index()] =
            allowed;
    }

    pub fn clear_authorized(&self) {
        *self.authorized.lock().expect("poisoned authorized luns") =
            [false; MAX_LUNS as usize];
    }

    pub fn set_initiator(&self, iqn: Iqn) {
        *self.initiator.lock().expect("poisoned initiator") = Some(iqn);
    }

    pub fn initiator(&self) -> Option<Iqn> {
        self.initiator.lock().expect("poisoned initiator").clone()
    }
}

pub struct TargetCore {
    pub scsi: Arc<ScsiCore>,
    pub target_iqn: Iqn,
    pub queue_depth: u32,
    pub buffer_size: u32,
    sessions: DashMap<usize, Arc<SessionHandle>>,
    free_ids: Mutex<Vec<usize>>,
    /// Cluster-wide listen addresses advertised through SendTargets.
    addresses: Mutex<Vec<Ipv4Addr>>,
}

impl TargetCore {
    pub fn new(
        scsi: Arc<ScsiCore>,
        target_iqn: Iqn,
        queue_depth: u32,
        buffer_size: u32,
    ) -> Arc<Self> {
        // the queue depth is padded by one so an initiator that filled the
        // window can still make progress after MaxCmdSN recomputation
        let queue_depth = queue_depth + 1;
        Arc::new(TargetCore {
            scsi,
            target_iqn,
            queue_depth,
            buffer_size,
            sessions: DashMap::new(),
            free_ids: Mutex::new((0..MAX_SESSIONS).rev().collect()),
            addresses: Mutex::new(Vec::new()),
        })
    }

    /// Claim a session slot on accept; `None` when the pool is exhausted.
    pub fn acquire_session(
        &self,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Option<Arc<SessionHandle>> {
        let id = self
            .free_ids
            .lock()
            .expect("poisoned session pool")
            .pop()?;
        let handle = SessionHandle::new(id, self.queue_depth, PduWriter::new(writer));
        self.sessions.insert(id, handle.clone());
        Some(handle)
    }

    pub fn release_session(&self, id: usize) {
        if self.sessions.remove(&id).is_some() {
            self.free_ids
                .lock()
                .expect("poisoned session pool")
                .push(id);
        }
    }

    pub fn session(&self, id: usize) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn set_cluster_addresses(&self, addrs: &[Ipv4Addr]) {
        *self.addresses.lock().expect("poisoned address list") = addrs.to_vec();
    }

    pub fn cluster_addresses(&self) -> Vec<Ipv4Addr> {
        self.addresses.lock().expect("poisoned address list").clone()
    }

    /// Initiators connected to a LUN, for admin queries.
    pub fn nth_connected_iqn(&self, lun: Lun, n: usize) -> Option<Iqn> {
        let mut found = 0;
        // dashmap iteration order is arbitrary but stable enough for admin
        // listings; sort by id to keep the answer deterministic
        let mut ids: Vec<usize> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        for id in ids {
            let Some(sess) = self.session(id) else { continue };
            if !sess.logged_in.load(Ordering::SeqCst) || !sess.is_authorized(lun) {
                continue;
            }
            if found == n {
                return sess.initiator();
            }
            found += 1;
        }
        None
    }

    fn send_async_event(&self, sess: Arc<SessionHandle>, lun: Lun, sense: [u8; SENSE_LEN]) {
        tokio::spawn(async move {
            let (stat_sn, exp_cmd_sn, max_cmd_sn) = sess.next_stat_sn();
            let builder = AsyncMessageBuilder::new(AsyncEventKind::ScsiEvent)
                .lun(lun.to_bhs_field())
                .stat_sn(stat_sn)
                .exp_cmd_sn(exp_cmd_sn)
                .max_cmd_sn(max_cmd_sn);
            let mut header = builder.header;
            let mut payload = Vec::with_capacity(2 + SENSE_LEN);
            payload.extend_from_slice(&(SENSE_LEN as u16).to_be_bytes());
            payload.extend_from_slice(&sense);
            header.set_data_length_bytes(payload.len() as u32);

            let mut bhs = [0u8; 48];
            if header.to_bhs_bytes(&mut bhs).is_ok()
                && let Err(e) = sess.writer.send_padded(&bhs, &payload).await
            {
                error!("session {}: async message send failed: {e}", sess.id);
            }
        });
    }
}

impl ScsiTransport for TargetCore {
    fn update_lun_access_authorizations(&self, export: &Export) {
        let Some(lun) = export.iscsi_lun() else {
            return;
        };
        for entry in self.sessions.iter() {
            let sess = entry.value();
            if !sess.logged_in.load(Ordering::SeqCst) {
                continue;
            }
            let Some(initiator) = sess.initiator() else {
                continue;
            };
            let allowed = export.policy_for_iqn(&initiator)
                == crate::export::iqn_filter::FilterPolicy::Accept;
            sess.set_authorized(lun, allowed);
        }
    }

    fn async_event(&self, local_session_id: usize, lun: Lun, sense: [u8; SENSE_LEN]) {
        if let Some(sess) = self.session(local_session_id)
            && sess.logged_in.load(Ordering::SeqCst)
        {
            self.send_async_event(sess, lun, sense);
        }
    }

    fn async_event_all_sessions(&self, lun: Lun, sense: [u8; SENSE_LEN]) {
        for entry in self.sessions.iter() {
            let sess = entry.value().clone();
            if sess.logged_in.load(Ordering::SeqCst) {
                self.send_async_event(sess, lun, sense);
            }
        }
    }
}

impl TargetAdapter for TargetCore {
    fn signal_new_export(
        &self,
        live: &Arc<LiveExport>,
        sector_count: u64,
    ) -> Result<(), LumError> {
        let desc = live.desc();
        let lun = desc.iscsi_lun().ok_or(LumError::ExportWrongMethod)?;
        let readonly = desc.readonly();
        drop(desc);

        self.scsi
            .luns
            .install_export(lun, live.clone(), sector_count, readonly);
        self.update_lun_access_authorizations(&live.desc());

        // tell every initiator the LUN landscape changed
        self.async_event_all_sessions(
            Lun::new(0).expect("LUN 0"),
            build_sense(key::UNIT_ATTENTION, asc::REPORTED_LUNS_DATA_HAS_CHANGED),
        );
        self.async_event_all_sessions(
            lun,
            build_sense(key::UNIT_ATTENTION, asc::INQUIRY_DATA_HAS_CHANGED),
        );
        Ok(())
    }

    fn signal_remove_export(&self, live: &Arc<LiveExport>) -> Result<(), LumError> {
        let lun = live
            .desc()
            .iscsi_lun()
            .ok_or(LumError::ExportWrongMethod)?;

        self.scsi.luns.remove_export(lun)?;
        for entry in self.sessions.iter() {
            entry.value().set_authorized(lun, false);
        }
        self.async_event_all_sessions(
            Lun::new(0).expect("LUN 0"),
            build_sense(key::UNIT_ATTENTION, asc::REPORTED_LUNS_DATA_HAS_CHANGED),
        );
        Ok(())
    }

    fn signal_update_iqn_filters(&self, live: &Arc<LiveExport>) {
        let desc = live.desc();
        let Some(lun) = desc.iscsi_lun() else { return };
        self.update_lun_access_authorizations(&desc);
        drop(desc);

        self.async_event_all_sessions(
            Lun::new(0).expect("LUN 0"),
            build_sense(key::UNIT_ATTENTION, asc::REPORTED_LUNS_DATA_HAS_CHANGED),
        );
        self.async_event_all_sessions(
            lun,
            build_sense(key::UNIT_ATTENTION, asc::INQUIRY_DATA_HAS_CHANGED),
        );
    }

    fn export_set_size(&self, live: &Arc<LiveExport>, sector_count: u64) {
        let Some(lun) = self
            .scsi
            .luns
            .find_lun_of_export(&live.uuid().to_string())
        else {
            error!("resize: export {} has no LUN", live.uuid());
            return;
        };
        if self.scsi.luns.set_sector_count(lun, sector_count) {
            self.async_event_all_sessions(
                lun,
                build_sense(key::UNIT_ATTENTION, asc::CAPACITY_DATA_HAS_CHANGED),
            );
        }
    }

    fn export_in_use(&self, live: &Arc<LiveExport>) -> bool {
        live.desc()
            .iscsi_lun()
            .is_some_and(|lun| self.scsi.luns.in_use(lun))
    }

    fn set_readahead(
        &self,
        _live: &Arc<LiveExport>,
        _readahead_sectors: u32,
    ) -> Result<(), LumError> {
        error!("don't know how to set readahead on an iSCSI export");
        Err(LumError::ExportWrongMethod)
    }
}
