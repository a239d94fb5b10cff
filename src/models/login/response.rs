// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
};

use crate::{
    models::{
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_format::ZeroCopyType,
        login::{
            common::{RawLoginFlags, Stage},
            status::{StatusClass, StatusDetail},
        },
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    },
    target::connection::FromBytes,
};

/// iSCSI protocol version this target speaks (both min and max).
pub const ISCSI_VERSION: u8 = 0;

/// BHS of a Login Response PDU.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LoginResponse {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: RawLoginFlags,         // 1
    pub version_max: u8,              // 2
    pub version_active: u8,           // 3
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    pub isid: [u8; 6],                // 8..14
    pub tsih: U16<BigEndian>,         // 14..16
    pub initiator_task_tag: u32,      // 16..20
    reserved1: [u8; 4],               // 20..24
    pub stat_sn: U32<BigEndian>,      // 24..28
    pub exp_cmd_sn: U32<BigEndian>,   // 28..32
    pub max_cmd_sn: U32<BigEndian>,   // 32..36
    pub status_class: u8,             // 36
    pub status_detail: u8,            // 37
    reserved2: [u8; 10],              // 38..48
}

impl LoginResponse {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow::anyhow!("failed convert buffer LoginResponse: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::LoginResp) {
            anyhow::bail!(
                "LoginResponse: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

/// Builder for Login Response PDUs (opcode `0x23`).
///
/// The login key=value answers go into the Data Segment through
/// `PduWithData::append_data`.
#[derive(Debug, Default)]
pub struct LoginResponseBuilder {
    pub header: LoginResponse,
}

impl LoginResponseBuilder {
    pub fn new(isid: [u8; 6], tsih: u16) -> Self {
        LoginResponseBuilder {
            header: LoginResponse {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::LoginResp);
                    tmp
                },
                isid,
                tsih: tsih.into(),
                ..Default::default()
            },
        }
    }

    pub fn transit(mut self, on: bool) -> Self {
        self.header.flags.set_transit(on);
        self
    }

    pub fn csg(mut self, stage: Stage) -> Self {
        self.header.flags.set_csg(stage);
        self
    }

    pub fn nsg(mut self, stage: Stage) -> Self {
        self.header.flags.set_nsg(stage);
        self
    }

    pub fn versions(mut self, max: u8, active: u8) -> Self {
        self.header.version_max = max;
        self.header.version_active = active;
        self
    }

    pub fn initiator_task_tag(mut self, tag: u32) -> Self {
        self.header.initiator_task_tag = tag;
        self
    }

    pub fn stat_sn(mut self, sn: u32) -> Self {
        self.header.stat_sn.set(sn);
        self
    }

    pub fn exp_cmd_sn(mut self, sn: u32) -> Self {
        self.header.exp_cmd_sn.set(sn);
        self
    }

    pub fn max_cmd_sn(mut self, sn: u32) -> Self {
        self.header.max_cmd_sn.set(sn);
        self
    }

    pub fn status(mut self, class: StatusClass, detail: StatusDetail) -> Self {
        self.header.status_class = class as u8;
        self.header.status_detail = detail as u8;
        self
    }
}

impl SendingData for LoginResponse {
    fn get_final_bit(&self) -> bool {
        !self.flags.cont()
    }

    fn set_final_bit(&mut self) {
        self.flags.set_cont(false);
    }

    fn get_continue_bit(&self) -> bool {
        self.flags.cont()
    }

    fn set_continue_bit(&mut self) {
        self.flags.set_cont(true);
    }
}

impl FromBytes for LoginResponse {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        LoginResponse::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for LoginResponse {
    #[inline]
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.to_bhs_bytes(buf)
    }

    #[inline]
    fn get_opcode(&self) -> Result<BhsOpcode> {
        BhsOpcode::try_from(self.opcode.raw())
    }

    fn get_initiator_task_tag(&self) -> u32 {
        self.initiator_task_tag
    }

    fn get_ahs_length_bytes(&self) -> usize {
        (self.total_ahs_length as usize) * 4
    }

    fn set_ahs_length_bytes(&mut self, len: u8) {
        self.total_ahs_length = len >> 2;
    }

    fn get_data_length_bytes(&self) -> usize {
        u32::from_be_bytes([
            0,
            self.data_segment_length[0],
            self.data_segment_length[1],
            self.data_segment_length[2],
        ]) as usize
    }

    fn set_data_length_bytes(&mut self, len: u32) {
        let be = len.to_be_bytes();
        self.data_segment_length = [be[1], be[2], be[3]];
    }
}

impl ZeroCopyType for LoginResponse {}
