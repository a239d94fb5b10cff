// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cluster reservation events and their packed wire form.
//!
//! Every reservation-affecting action is packed as
//! `lun u16 | session u16 | kind u8 | payload` and pushed through the
//! cluster ordering engine so all nodes apply the same sequence.

use anyhow::{Result, bail};

use crate::{
    cfg::config::MAX_SESSIONS,
    cluster::node::NodeId,
    export::lun::Lun,
    scsi::cdb::CDB_MAX_FIXED_LENGTH,
};

/// Cluster-unique session identity.
///
/// The keyspace is narrow on purpose: local ids are bounded by the session
/// pool, so the modulo can never fold two live sessions together.
pub type GlobalSessionId = u16;

pub fn global_session_id(local_session_id: usize, node: NodeId) -> GlobalSessionId {
    (local_session_id % MAX_SESSIONS + MAX_SESSIONS * node.value() as usize) as u16
}

pub fn split_global_session_id(gsid: GlobalSessionId) -> (NodeId, usize) {
    (
        NodeId::new(gsid as u32 / MAX_SESSIONS as u32),
        gsid as usize % MAX_SESSIONS,
    )
}

/// PR-OUT payload: the fixed-size CDB followed by the parameter list.
pub const RESERVE_OUT_PAYLOAD_LEN: usize = CDB_MAX_FIXED_LENGTH + 24;

const KIND_RESERVE_OUT: u8 = 0;
const KIND_NEW_SESSION: u8 = 1;
const KIND_DEL_SESSION: u8 = 2;
const KIND_LUN_RESET: u8 = 3;

/// Marker in the packed lun field for "all LUNs" and "no LUN".
const LUN_FIELD_ALL: u16 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A session reached full feature on some node.
    NewSession { gsid: GlobalSessionId },
    /// A session went away; its registrations die with it.
    DelSession { gsid: GlobalSessionId },
    /// PR-OUT / RESERVE(6) / RELEASE(6): CDB plus parameter bytes.
    ReserveOut {
        lun: Lun,
        gsid: GlobalSessionId,
        payload: [u8; RESERVE_OUT_PAYLOAD_LEN],
    },
    /// Logical unit reset; `None` resets every LUN (target warm/cold reset).
    LogicalUnitReset { lun: Option<Lun> },
}

impl ClusterEvent {
    pub fn reserve_out(
        lun: Lun,
        gsid: GlobalSessionId,
        cdb: &[u8; CDB_MAX_FIXED_LENGTH],
        params: &[u8],
    ) -> Self {
        let mut payload = [0u8; RESERVE_OUT_PAYLOAD_LEN];
        payload[..CDB_MAX_FIXED_LENGTH].copy_from_slice(cdb);
        let n = params.len().min(RESERVE_OUT_PAYLOAD_LEN - CDB_MAX_FIXED_LENGTH);
        payload[CDB_MAX_FIXED_LENGTH..CDB_MAX_FIXED_LENGTH + n]
            .copy_from_slice(&params[..n]);
        ClusterEvent::ReserveOut { lun, gsid, payload }
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + RESERVE_OUT_PAYLOAD_LEN);
        match self {
            ClusterEvent::ReserveOut { lun, gsid, payload } => {
                buf.extend_from_slice(&(lun.value() as u16).to_be_bytes());
                buf.extend_from_slice(&gsid.to_be_bytes());
                buf.push(KIND_RESERVE_OUT);
                buf.extend_from_slice(payload);
            },
            ClusterEvent::NewSession { gsid } => {
                buf.extend_from_slice(&LUN_FIELD_ALL.to_be_bytes());
                buf.extend_from_slice(&gsid.to_be_bytes());
                buf.push(KIND_NEW_SESSION);
            },
            ClusterEvent::DelSession { gsid } => {
                buf.extend_from_slice(&LUN_FIELD_ALL.to_be_bytes());
                buf.extend_from_slice(&gsid.to_be_bytes());
                buf.push(KIND_DEL_SESSION);
            },
            ClusterEvent::LogicalUnitReset { lun } => {
                let field = match lun {
                    Some(l) => l.value() as u16,
                    None => LUN_FIELD_ALL,
                };
                buf.extend_from_slice(&field.to_be_bytes());
                buf.extend_from_slice(&0u16.to_be_bytes());
                buf.push(KIND_LUN_RESET);
            },
        }
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            bail!("cluster event too short: {}", buf.len());
        }
        let lun_field = u16::from_be_bytes([buf[0], buf[1]]);
        let gsid = u16::from_be_bytes([buf[2], buf[3]]);
        match buf[4] {
            KIND_RESERVE_OUT => {
                if buf.len() < 5 + RESERVE_OUT_PAYLOAD_LEN {
                    bail!("reserve-out event truncated: {}", buf.len());
                }
                let lun = Lun::new(lun_field as u64)?;
                let mut payload = [0u8; RESERVE_OUT_PAYLOAD_LEN];
                payload.copy_from_slice(&buf[5..5 + RESERVE_OUT_PAYLOAD_LEN]);
                Ok(ClusterEvent::ReserveOut { lun, gsid, payload })
            },
            KIND_NEW_SESSION => Ok(ClusterEvent::NewSession { gsid }),
            KIND_DEL_SESSION => Ok(ClusterEvent::DelSession { gsid }),
            KIND_LUN_RESET => {
                let lun = if lun_field == LUN_FIELD_ALL {
                    None
                } else {
                    Some(Lun::new(lun_field as u64)?)
                };
                Ok(ClusterEvent::LogicalUnitReset { lun })
            },
            other => bail!("unknown cluster event kind: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_session_id_round_trip() {
        let gsid = global_session_id(5, NodeId::new(3));
        assert_eq!(gsid as usize, 5 + 3 * MAX_SESSIONS);
        assert_eq!(split_global_session_id(gsid), (NodeId::new(3), 5));
    }

    #[test]
    fn event_pack_round_trip() {
        let lun = Lun::new(7).expect("valid");
        let mut cdb = [0u8; CDB_MAX_FIXED_LENGTH];
        cdb[0] = 0x5F;
        let params = [9u8; 24];
        let events = [
            ClusterEvent::reserve_out(lun, 42, &cdb, &params),
            ClusterEvent::NewSession { gsid: 1 },
            ClusterEvent::DelSession { gsid: 2 },
            ClusterEvent::LogicalUnitReset { lun: Some(lun) },
            ClusterEvent::LogicalUnitReset { lun: None },
        ];
        for ev in &events {
            let packed = ev.pack();
            assert_eq!(&ClusterEvent::unpack(&packed).expect("unpack"), ev);
        }
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert!(ClusterEvent::unpack(&[]).is_err());
        assert!(ClusterEvent::unpack(&[0, 1, 0, 0, 99]).is_err());
        // truncated reserve-out
        assert!(ClusterEvent::unpack(&[0, 1, 0, 0, KIND_RESERVE_OUT, 1, 2]).is_err());
    }
}
