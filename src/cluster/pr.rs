// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The persistent-reservation context: SPC-3 registrations and reservations
//! plus the SPC-2 RESERVE/RELEASE state, per LUN.
//!
//! The context is deterministic: two nodes applying the same event sequence
//! to equal contexts end with equal contexts, which is what lets the cluster
//! replay ordered CDBs instead of shipping state. Pack/unpack exists for the
//! one case where state does travel: bringing a joining node up to date.

use anyhow::{Result, bail};

use crate::{
    cluster::event::GlobalSessionId,
    export::lun::{Lun, MAX_LUNS},
    scsi::{
        cdb::{self, op},
        sense::{CommandStatus, asc, key},
    },
};

/// Bound on registrations per LUN; sets the packed snapshot size.
pub const MAX_PR_REGISTRATIONS: usize = 32;

const NO_SESSION: u16 = 0xFFFF;

/// SPC-3 reservation types (table 107).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PrType {
    WriteExclusive = 0x1,
    ExclusiveAccess = 0x3,
    WriteExclusiveRegistrantsOnly = 0x5,
    ExclusiveAccessRegistrantsOnly = 0x6,
    WriteExclusiveAllRegistrants = 0x7,
    ExclusiveAccessAllRegistrants = 0x8,
}

impl PrType {
    pub fn from_u4(v: u8) -> Option<Self> {
        Some(match v & 0x0F {
            0x1 => Self::WriteExclusive,
            0x3 => Self::ExclusiveAccess,
            0x5 => Self::WriteExclusiveRegistrantsOnly,
            0x6 => Self::ExclusiveAccessRegistrantsOnly,
            0x7 => Self::WriteExclusiveAllRegistrants,
            0x8 => Self::ExclusiveAccessAllRegistrants,
            _ => return None,
        })
    }

    fn registrants_only(self) -> bool {
        matches!(
            self,
            Self::WriteExclusiveRegistrantsOnly
                | Self::ExclusiveAccessRegistrantsOnly
                | Self::WriteExclusiveAllRegistrants
                | Self::ExclusiveAccessAllRegistrants
        )
    }

    fn excludes_reads(self) -> bool {
        matches!(
            self,
            Self::ExclusiveAccess
                | Self::ExclusiveAccessRegistrantsOnly
                | Self::ExclusiveAccessAllRegistrants
        )
    }
}

/// PR-OUT service actions (SPC-3 table 102).
mod service_action {
    pub const REGISTER: u8 = 0x00;
    pub const RESERVE: u8 = 0x01;
    pub const RELEASE: u8 = 0x02;
    pub const CLEAR: u8 = 0x03;
    pub const PREEMPT: u8 = 0x04;
    pub const PREEMPT_AND_ABORT: u8 = 0x05;
    pub const REGISTER_AND_IGNORE: u8 = 0x06;
}

/// PR-IN service actions (SPC-3 table 101).
mod pr_in_action {
    pub const READ_KEYS: u8 = 0x00;
    pub const READ_RESERVATION: u8 = 0x01;
    pub const REPORT_CAPABILITIES: u8 = 0x02;
}

/// Outcome of an ordered reservation mutation, reported back to the
/// originating node only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrStatus {
    Good,
    Conflict,
    Check { sense_key: u8, asc_ascq: u16 },
}

impl From<PrStatus> for CommandStatus {
    fn from(st: PrStatus) -> CommandStatus {
        match st {
            PrStatus::Good => CommandStatus::good_empty(),
            PrStatus::Conflict => CommandStatus::reservation_conflict(),
            PrStatus::Check { sense_key, asc_ascq } => {
                CommandStatus::check_condition(sense_key, asc_ascq)
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LunPrState {
    /// `gsid -> key`, kept sorted for a canonical packed form.
    registrations: std::collections::BTreeMap<GlobalSessionId, u64>,
    holder: Option<GlobalSessionId>,
    pr_type: Option<PrType>,
    /// SPC-2 RESERVE(6) owner.
    spc2_reserved_by: Option<GlobalSessionId>,
    generation: u32,
}

const LUN_PACKED_SIZE: usize = 2 + 1 + 2 + 4 + 2 + MAX_PR_REGISTRATIONS * (2 + 8);

impl LunPrState {
    fn key_of(&self, gsid: GlobalSessionId) -> Option<u64> {
        self.registrations.get(&gsid).copied()
    }

    fn holder_includes(&self, gsid: GlobalSessionId) -> bool {
        match (self.holder, self.pr_type) {
            (Some(h), _) if h == gsid => true,
            // all-registrants reservations are held by every registrant
            (
                Some(_),
                Some(
                    PrType::WriteExclusiveAllRegistrants
                    | PrType::ExclusiveAccessAllRegistrants,
                ),
            ) => self.registrations.contains_key(&gsid),
            _ => false,
        }
    }

    fn drop_registration(&mut self, gsid: GlobalSessionId) {
        self.registrations.remove(&gsid);
        if self.holder == Some(gsid) {
            self.holder = None;
            self.pr_type = None;
        }
    }

    fn pack_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.holder.unwrap_or(NO_SESSION).to_be_bytes());
        buf.push(self.pr_type.map_or(0, |t| t as u8));
        buf.extend_from_slice(
            &self.spc2_reserved_by.unwrap_or(NO_SESSION).to_be_bytes(),
        );
        buf.extend_from_slice(&self.generation.to_be_bytes());
        buf.extend_from_slice(&(self.registrations.len() as u16).to_be_bytes());
        for (gsid, pr_key) in &self.registrations {
            buf.extend_from_slice(&gsid.to_be_bytes());
            buf.extend_from_slice(&pr_key.to_be_bytes());
        }
        for _ in self.registrations.len()..MAX_PR_REGISTRATIONS {
            buf.extend_from_slice(&[0u8; 10]);
        }
    }

    fn unpack_from(buf: &[u8]) -> Result<Self> {
        let holder = u16::from_be_bytes([buf[0], buf[1]]);
        let pr_type = if buf[2] == 0 {
            None
        } else {
            Some(
                PrType::from_u4(buf[2])
                    .ok_or_else(|| anyhow::anyhow!("bad PR type {}", buf[2]))?,
            )
        };
        let spc2 = u16::from_be_bytes([buf[3], buf[4]]);
        let generation = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
        let count = u16::from_be_bytes([buf[9], buf[10]]) as usize;
        if count > MAX_PR_REGISTRATIONS {
            bail!("registration count {count} over bound");
        }
        let mut registrations = std::collections::BTreeMap::new();
        for i in 0..count {
            let at = 11 + i * 10;
            let gsid = u16::from_be_bytes([buf[at], buf[at + 1]]);
            let pr_key = u64::from_be_bytes([
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
                buf[at + 8],
                buf[at + 9],
            ]);
            registrations.insert(gsid, pr_key);
        }
        Ok(LunPrState {
            registrations,
            holder: (holder != NO_SESSION).then_some(holder),
            pr_type,
            spc2_reserved_by: (spc2 != NO_SESSION).then_some(spc2),
            generation,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrContext {
    luns: Vec<LunPrState>,
}

impl Default for PrContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PrContext {
    pub fn new() -> Self {
        PrContext {
            luns: vec![LunPrState::default(); MAX_LUNS as usize],
        }
    }

    pub const fn packed_size() -> usize {
        MAX_LUNS as usize * LUN_PACKED_SIZE
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::packed_size());
        for lun in &self.luns {
            lun.pack_into(&mut buf);
        }
        debug_assert_eq!(buf.len(), Self::packed_size());
        buf
    }

    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::packed_size() {
            bail!(
                "packed PR context size mismatch: {} != {}",
                buf.len(),
                Self::packed_size()
            );
        }
        let mut luns = Vec::with_capacity(MAX_LUNS as usize);
        for i in 0..MAX_LUNS as usize {
            luns.push(LunPrState::unpack_from(
                &buf[i * LUN_PACKED_SIZE..(i + 1) * LUN_PACKED_SIZE],
            )?);
        }
        Ok(PrContext { luns })
    }

    fn lun(&self, lun: Lun) -> &LunPrState {
        &self.luns[lun.index()]
    }

    fn lun_mut(&mut self, lun: Lun) -> &mut LunPrState {
        &mut self.luns[lun.index()]
    }

    pub fn add_session(&mut self, _gsid: GlobalSessionId) {
        // nothing to pre-create: a session without registrations owns nothing
    }

    /// A session died: its registrations, reservations and SPC-2 reserves go
    /// with it, on every LUN.
    pub fn del_session(&mut self, gsid: GlobalSessionId) {
        for state in &mut self.luns {
            state.drop_registration(gsid);
            if state.spc2_reserved_by == Some(gsid) {
                state.spc2_reserved_by = None;
            }
        }
    }

    /// SPC-2 cleanup half of a logical unit reset.
    pub fn reset_lun_reservation(&mut self, lun: Lun) {
        self.lun_mut(lun).spc2_reserved_by = None;
    }

    /// Apply a reservation-changing CDB (PR-OUT, RESERVE(6), RELEASE(6)).
    /// Deterministic: every node gets the same answer.
    pub fn reserve_out(
        &mut self,
        lun: Lun,
        cdb_bytes: &[u8; 16],
        params: &[u8],
        gsid: GlobalSessionId,
    ) -> PrStatus {
        match cdb_bytes[0] {
            op::RESERVE_6 => self.spc2_reserve(lun, gsid),
            op::RELEASE_6 => self.spc2_release(lun, gsid),
            op::PERSISTENT_RESERVE_OUT => self.pr_out(lun, cdb_bytes, params, gsid),
            _ => PrStatus::Check {
                sense_key: key::ILLEGAL_REQUEST,
                asc_ascq: asc::INVALID_COMMAND_OPERATION_CODE,
            },
        }
    }

    fn spc2_reserve(&mut self, lun: Lun, gsid: GlobalSessionId) -> PrStatus {
        let state = self.lun_mut(lun);
        // SPC-2 reserve is refused while SPC-3 reservations are active
        if state.holder.is_some() {
            return PrStatus::Conflict;
        }
        match state.spc2_reserved_by {
            Some(owner) if owner != gsid => PrStatus::Conflict,
            _ => {
                state.spc2_reserved_by = Some(gsid);
                PrStatus::Good
            },
        }
    }

    fn spc2_release(&mut self, lun: Lun, gsid: GlobalSessionId) -> PrStatus {
        let state = self.lun_mut(lun);
        // releasing someone else's reservation is a silent no-op per SPC-2
        if state.spc2_reserved_by == Some(gsid) {
            state.spc2_reserved_by = None;
        }
        PrStatus::Good
    }

    fn pr_out(
        &mut self,
        lun: Lun,
        cdb_bytes: &[u8; 16],
        params: &[u8],
        gsid: GlobalSessionId,
    ) -> PrStatus {
        if params.len() < 24 {
            return PrStatus::Check {
                sense_key: key::ILLEGAL_REQUEST,
                asc_ascq: asc::INVALID_FIELD_IN_CDB,
            };
        }
        let action = cdb_bytes[1] & 0x1F;
        let scope = cdb_bytes[2] >> 4;
        let rtype = PrType::from_u4(cdb_bytes[2]);
        let res_key = u64::from_be_bytes(params[0..8].try_into().expect("8 bytes"));
        let sa_key = u64::from_be_bytes(params[8..16].try_into().expect("8 bytes"));

        // only LU_SCOPE (0) exists in SPC-3
        if scope != 0 && matches!(action, service_action::RESERVE) {
            return PrStatus::Check {
                sense_key: key::ILLEGAL_REQUEST,
                asc_ascq: asc::INVALID_FIELD_IN_CDB,
            };
        }

        let state = self.lun_mut(lun);
        match action {
            service_action::REGISTER => {
                match state.key_of(gsid) {
                    None => {
                        if res_key != 0 {
                            return PrStatus::Conflict;
                        }
                        if sa_key != 0 {
                            if state.registrations.len() >= MAX_PR_REGISTRATIONS {
                                return PrStatus::Check {
                                    sense_key: key::ILLEGAL_REQUEST,
                                    asc_ascq: asc::INVALID_FIELD_IN_CDB,
                                };
                            }
                            state.registrations.insert(gsid, sa_key);
                        }
                    },
                    Some(current) => {
                        if current != res_key {
                            return PrStatus::Conflict;
                        }
                        if sa_key == 0 {
                            state.drop_registration(gsid);
                        } else {
                            state.registrations.insert(gsid, sa_key);
                        }
                    },
                }
                state.generation = state.generation.wrapping_add(1);
                PrStatus::Good
            },
            service_action::REGISTER_AND_IGNORE => {
                if sa_key == 0 {
                    state.drop_registration(gsid);
                } else {
                    if state.key_of(gsid).is_none()
                        && state.registrations.len() >= MAX_PR_REGISTRATIONS
                    {
                        return PrStatus::Check {
                            sense_key: key::ILLEGAL_REQUEST,
                            asc_ascq: asc::INVALID_FIELD_IN_CDB,
                        };
                    }
                    state.registrations.insert(gsid, sa_key);
                }
                state.generation = state.generation.wrapping_add(1);
                PrStatus::Good
            },
            service_action::RESERVE => {
                let Some(rtype) = rtype else {
                    return PrStatus::Check {
                        sense_key: key::ILLEGAL_REQUEST,
                        asc_ascq: asc::INVALID_FIELD_IN_CDB,
                    };
                };
                if state.key_of(gsid) != Some(res_key) {
                    return PrStatus::Conflict;
                }
                match (state.holder, state.pr_type) {
                    (None, _) => {
                        state.holder = Some(gsid);
                        state.pr_type = Some(rtype);
                        PrStatus::Good
                    },
                    (Some(h), Some(t)) if h == gsid && t == rtype => PrStatus::Good,
                    _ => PrStatus::Conflict,
                }
            },
            service_action::RELEASE => {
                if state.key_of(gsid) != Some(res_key) {
                    return PrStatus::Conflict;
                }
                if state.holder == Some(gsid) {
                    match rtype {
                        Some(t) if state.pr_type == Some(t) => {
                            state.holder = None;
                            state.pr_type = None;
                        },
                        // wrong type on release: the reservation stays
                        _ => return PrStatus::Conflict,
                    }
                }
                PrStatus::Good
            },
            service_action::CLEAR => {
                if state.key_of(gsid) != Some(res_key) {
                    return PrStatus::Conflict;
                }
                state.registrations.clear();
                state.holder = None;
                state.pr_type = None;
                state.generation = state.generation.wrapping_add(1);
                PrStatus::Good
            },
            service_action::PREEMPT | service_action::PREEMPT_AND_ABORT => {
                if state.key_of(gsid) != Some(res_key) {
                    return PrStatus::Conflict;
                }
                if sa_key == 0 {
                    return PrStatus::Check {
                        sense_key: key::ILLEGAL_REQUEST,
                        asc_ascq: asc::INVALID_FIELD_IN_CDB,
                    };
                }
                let victims: Vec<GlobalSessionId> = state
                    .registrations
                    .iter()
                    .filter(|&(_, k)| *k == sa_key)
                    .map(|(s, _)| *s)
                    .collect();
                if victims.is_empty() {
                    return PrStatus::Conflict;
                }
                let preempted_holder =
                    state.holder.is_some_and(|h| victims.contains(&h));
                for v in victims {
                    state.registrations.remove(&v);
                }
                if preempted_holder {
                    state.holder = Some(gsid);
                    state.pr_type = rtype.or(state.pr_type);
                }
                state.generation = state.generation.wrapping_add(1);
                PrStatus::Good
            },
            _ => PrStatus::Check {
                sense_key: key::ILLEGAL_REQUEST,
                asc_ascq: asc::INVALID_FIELD_IN_CDB,
            },
        }
    }

    /// PERSISTENT RESERVE IN, served locally under the PR lock.
    pub fn reserve_in(
        &self,
        lun: Lun,
        cdb_bytes: &[u8; 16],
        gsid: GlobalSessionId,
    ) -> CommandStatus {
        let _ = gsid;
        let action = cdb_bytes[1] & 0x1F;
        let alloc_len = u16::from_be_bytes([cdb_bytes[7], cdb_bytes[8]]) as usize;
        let state = self.lun(lun);

        let mut data = Vec::new();
        match action {
            pr_in_action::READ_KEYS => {
                data.extend_from_slice(&state.generation.to_be_bytes());
                data.extend_from_slice(
                    &((state.registrations.len() * 8) as u32).to_be_bytes(),
                );
                for pr_key in state.registrations.values() {
                    data.extend_from_slice(&pr_key.to_be_bytes());
                }
            },
            pr_in_action::READ_RESERVATION => {
                data.extend_from_slice(&state.generation.to_be_bytes());
                match (state.holder, state.pr_type) {
                    (Some(holder), Some(t)) => {
                        let holder_key = state.key_of(holder).unwrap_or(0);
                        data.extend_from_slice(&16u32.to_be_bytes());
                        data.extend_from_slice(&holder_key.to_be_bytes());
                        data.extend_from_slice(&0u32.to_be_bytes()); // obsolete
                        data.push(0); // reserved
                        data.push(t as u8); // scope = LU (0) | type
                        data.extend_from_slice(&0u16.to_be_bytes()); // obsolete
                    },
                    _ => data.extend_from_slice(&0u32.to_be_bytes()),
                }
            },
            pr_in_action::REPORT_CAPABILITIES => {
                data.extend_from_slice(&8u16.to_be_bytes());
                data.push(0); // no PTPL, no ATP
                data.push(0); // TMV = 0
                data.extend_from_slice(&[0, 0, 0, 0]);
            },
            _ => {
                return CommandStatus::check_condition(
                    key::ILLEGAL_REQUEST,
                    asc::INVALID_FIELD_IN_CDB,
                );
            },
        }

        data.truncate(alloc_len);
        CommandStatus::good(data)
    }

    /// The pure rights inspection: false exactly when the SCSI standard
    /// requires RESERVATION CONFLICT for this command from this session.
    pub fn check_rights(
        &self,
        lun: Lun,
        cdb_bytes: &[u8; 16],
        gsid: GlobalSessionId,
    ) -> bool {
        let opcode = cdb_bytes[0];
        let state = self.lun(lun);

        // reservation-management commands arbitrate conflicts themselves
        if opcode == op::PERSISTENT_RESERVE_IN || cdb::is_reservation_opcode(opcode) {
            // except that an SPC-2 reserve walls off PR-OUT from other nexuses
            if opcode == op::PERSISTENT_RESERVE_OUT
                && state.spc2_reserved_by.is_some_and(|o| o != gsid)
            {
                return false;
            }
            return true;
        }

        // SPC-2: everything conflicts for other initiators while reserved
        if state.spc2_reserved_by.is_some_and(|o| o != gsid) {
            return false;
        }

        let Some(pr_type) = state.pr_type else {
            return true;
        };
        if state.holder_includes(gsid) {
            return true;
        }

        let registered = state.registrations.contains_key(&gsid);
        let allowed_by_registration = pr_type.registrants_only() && registered;

        if cdb::is_write_opcode(opcode) {
            return allowed_by_registration;
        }
        if cdb::is_read_opcode(opcode) {
            if pr_type.excludes_reads() {
                return allowed_by_registration;
            }
            return true;
        }

        // non-medium commands (TUR, MODE SENSE, capacity reads) pass
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lun(v: u64) -> Lun {
        Lun::new(v).expect("valid")
    }

    fn pr_out_cdb(action: u8, rtype: u8) -> [u8; 16] {
        let mut c = [0u8; 16];
        c[0] = op::PERSISTENT_RESERVE_OUT;
        c[1] = action;
        c[2] = rtype;
        c
    }

    fn params(res_key: u64, sa_key: u64) -> [u8; 24] {
        let mut p = [0u8; 24];
        p[0..8].copy_from_slice(&res_key.to_be_bytes());
        p[8..16].copy_from_slice(&sa_key.to_be_bytes());
        p
    }

    fn register(ctx: &mut PrContext, l: Lun, gsid: u16, pr_key: u64) {
        assert_eq!(
            ctx.reserve_out(
                l,
                &pr_out_cdb(service_action::REGISTER, 0),
                &params(0, pr_key),
                gsid
            ),
            PrStatus::Good
        );
    }

    #[test]
    fn register_then_reserve_exclusive() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(3), 1, 0xAA);
        register(&mut ctx, lun(3), 2, 0xBB);

        assert_eq!(
            ctx.reserve_out(
                lun(3),
                &pr_out_cdb(service_action::RESERVE, PrType::WriteExclusive as u8),
                &params(0xAA, 0),
                1
            ),
            PrStatus::Good
        );

        // writes from the other registered session now conflict
        let mut write10 = [0u8; 16];
        write10[0] = op::WRITE_10;
        assert!(!ctx.check_rights(lun(3), &write10, 2));
        assert!(ctx.check_rights(lun(3), &write10, 1));

        // write-exclusive still lets others read
        let mut read10 = [0u8; 16];
        read10[0] = op::READ_10;
        assert!(ctx.check_rights(lun(3), &read10, 2));
    }

    #[test]
    fn register_with_wrong_key_conflicts() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(0), 1, 0xAA);
        assert_eq!(
            ctx.reserve_out(
                lun(0),
                &pr_out_cdb(service_action::REGISTER, 0),
                &params(0xDEAD, 0xCC),
                1
            ),
            PrStatus::Conflict
        );
        // an unregistered nexus must present key 0
        assert_eq!(
            ctx.reserve_out(
                lun(0),
                &pr_out_cdb(service_action::REGISTER, 0),
                &params(0x1, 0xCC),
                2
            ),
            PrStatus::Conflict
        );
    }

    #[test]
    fn unregister_drops_reservation() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(0), 1, 0xAA);
        assert_eq!(
            ctx.reserve_out(
                lun(0),
                &pr_out_cdb(service_action::RESERVE, PrType::ExclusiveAccess as u8),
                &params(0xAA, 0),
                1
            ),
            PrStatus::Good
        );
        // REGISTER with sa_key 0 unregisters and releases
        assert_eq!(
            ctx.reserve_out(
                lun(0),
                &pr_out_cdb(service_action::REGISTER, 0),
                &params(0xAA, 0),
                1
            ),
            PrStatus::Good
        );
        let mut read10 = [0u8; 16];
        read10[0] = op::READ_10;
        assert!(ctx.check_rights(lun(0), &read10, 2));
    }

    #[test]
    fn release_wrong_type_keeps_reservation() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(1), 1, 0xAA);
        ctx.reserve_out(
            lun(1),
            &pr_out_cdb(service_action::RESERVE, PrType::ExclusiveAccess as u8),
            &params(0xAA, 0),
            1,
        );
        assert_eq!(
            ctx.reserve_out(
                lun(1),
                &pr_out_cdb(service_action::RELEASE, PrType::WriteExclusive as u8),
                &params(0xAA, 0),
                1
            ),
            PrStatus::Conflict
        );
        let mut read10 = [0u8; 16];
        read10[0] = op::READ_10;
        assert!(!ctx.check_rights(lun(1), &read10, 2));
    }

    #[test]
    fn preempt_removes_victim_and_takes_over() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(2), 1, 0xAA);
        register(&mut ctx, lun(2), 2, 0xBB);
        ctx.reserve_out(
            lun(2),
            &pr_out_cdb(service_action::RESERVE, PrType::WriteExclusive as u8),
            &params(0xBB, 0),
            2,
        );
        assert_eq!(
            ctx.reserve_out(
                lun(2),
                &pr_out_cdb(service_action::PREEMPT, PrType::ExclusiveAccess as u8),
                &params(0xAA, 0xBB),
                1
            ),
            PrStatus::Good
        );
        let mut write10 = [0u8; 16];
        write10[0] = op::WRITE_10;
        assert!(ctx.check_rights(lun(2), &write10, 1));
        assert!(!ctx.check_rights(lun(2), &write10, 2));
    }

    #[test]
    fn spc2_reserve_walls_off_other_sessions() {
        let mut ctx = PrContext::new();
        let mut reserve6 = [0u8; 16];
        reserve6[0] = op::RESERVE_6;
        assert_eq!(ctx.reserve_out(lun(4), &reserve6, &[0; 24], 1), PrStatus::Good);

        let mut tur = [0u8; 16];
        tur[0] = op::TEST_UNIT_READY;
        assert!(!ctx.check_rights(lun(4), &tur, 2));
        assert!(ctx.check_rights(lun(4), &tur, 1));

        assert_eq!(
            ctx.reserve_out(lun(4), &reserve6, &[0; 24], 2),
            PrStatus::Conflict
        );

        // LU reset clears the SPC-2 reservation
        ctx.reset_lun_reservation(lun(4));
        assert!(ctx.check_rights(lun(4), &tur, 2));
    }

    #[test]
    fn del_session_cleans_up() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(5), 7, 0xAA);
        ctx.reserve_out(
            lun(5),
            &pr_out_cdb(service_action::RESERVE, PrType::ExclusiveAccess as u8),
            &params(0xAA, 0),
            7,
        );
        ctx.del_session(7);
        let mut read10 = [0u8; 16];
        read10[0] = op::READ_10;
        assert!(ctx.check_rights(lun(5), &read10, 9));
    }

    #[test]
    fn read_keys_reports_registrations() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(6), 1, 0xAA);
        register(&mut ctx, lun(6), 2, 0xBB);
        let mut cdb_in = [0u8; 16];
        cdb_in[0] = op::PERSISTENT_RESERVE_IN;
        cdb_in[1] = pr_in_action::READ_KEYS;
        cdb_in[7..9].copy_from_slice(&4096u16.to_be_bytes());
        let r = ctx.reserve_in(lun(6), &cdb_in, 1);
        let add_len = u32::from_be_bytes(r.data[4..8].try_into().expect("4"));
        assert_eq!(add_len, 16);
        assert_eq!(&r.data[8..16], &0xAAu64.to_be_bytes());
        assert_eq!(&r.data[16..24], &0xBBu64.to_be_bytes());
    }

    #[test]
    fn pack_unpack_round_trip() {
        let mut ctx = PrContext::new();
        register(&mut ctx, lun(3), 1, 0xAA);
        register(&mut ctx, lun(3), 2, 0xBB);
        ctx.reserve_out(
            lun(3),
            &pr_out_cdb(service_action::RESERVE, PrType::WriteExclusive as u8),
            &params(0xAA, 0),
            1,
        );
        let mut reserve6 = [0u8; 16];
        reserve6[0] = op::RESERVE_6;
        ctx.reserve_out(lun(9), &reserve6, &[0; 24], 4);

        let packed = ctx.pack();
        assert_eq!(packed.len(), PrContext::packed_size());
        assert_eq!(PrContext::unpack(&packed).expect("unpack"), ctx);
    }
}
