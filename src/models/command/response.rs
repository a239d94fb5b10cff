// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

use crate::{
    models::{
        command::{
            common::{ResponseCode, ScsiStatus},
            zero_copy::{RawResponseCode, RawScsiCmdRespFlags, RawScsiStatus},
        },
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_format::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    },
    target::connection::FromBytes,
};

/// BHS of a SCSI Response PDU (opcode `0x21`).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiCommandResponse {
    pub opcode: RawBhsOpcode,                 // 0
    pub flags: RawScsiCmdRespFlags,           // 1
    pub response: RawResponseCode,            // 2
    pub status: RawScsiStatus,                // 3
    pub total_ahs_length: u8,                 // 4
    pub data_segment_length: [u8; 3],         // 5..8
    reserved1: [u8; 8],                       // 8..16
    pub initiator_task_tag: u32,              // 16..20
    pub snack_tag: U32<BigEndian>,            // 20..24
    pub stat_sn: U32<BigEndian>,              // 24..28
    pub exp_cmd_sn: U32<BigEndian>,           // 28..32
    pub max_cmd_sn: U32<BigEndian>,           // 32..36
    pub exp_data_sn: U32<BigEndian>,          // 36..40
    pub bidi_residual_count: U32<BigEndian>,  // 40..44
    pub residual_count: U32<BigEndian>,       // 44..48
}

impl ScsiCommandResponse {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed convert buffer ScsiCommandResponse: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::ScsiCommandResp) {
            bail!(
                "ScsiCommandResponse: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

/// Builder for SCSI Response PDUs.
///
/// Sense data (when status is CHECK CONDITION) goes into the Data Segment,
/// prefixed with its 2-byte length, via `PduWithData::append_data`.
#[derive(Debug, Default)]
pub struct ScsiCommandResponseBuilder {
    pub header: ScsiCommandResponse,
}

impl ScsiCommandResponseBuilder {
    pub fn new() -> Self {
        ScsiCommandResponseBuilder {
            header: ScsiCommandResponse {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::ScsiCommandResp);
                    tmp
                },
                flags: {
                    let mut tmp = RawScsiCmdRespFlags::default();
                    tmp.set_fin(true);
                    tmp
                },
                ..Default::default()
            },
        }
    }

    pub fn response(mut self, rc: ResponseCode) -> Self {
        self.header.response.encode(rc);
        self
    }

    pub fn status(mut self, st: ScsiStatus) -> Self {
        self.header.status.encode(st);
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

    /// Report that fewer bytes moved than the initiator expected.
    pub fn residual_underflow(mut self, count: u32) -> Self {
        if count > 0 {
            self.header.flags.set_underflow(true);
            self.header.residual_count.set(count);
        }
        self
    }

    /// Report that the command produced more than the initiator allotted.
    pub fn residual_overflow(mut self, count: u32) -> Self {
        if count > 0 {
            self.header.flags.set_overflow(true);
            self.header.residual_count.set(count);
        }
        self
    }
}

impl SendingData for ScsiCommandResponse {
    fn get_final_bit(&self) -> bool {
        self.flags.fin()
    }

    fn set_final_bit(&mut self) {
        self.flags.set_fin(true);
    }

    fn get_continue_bit(&self) -> bool {
        !self.flags.fin()
    }

    fn set_continue_bit(&mut self) {
        self.flags.set_fin(false);
    }
}

impl FromBytes for ScsiCommandResponse {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        ScsiCommandResponse::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for ScsiCommandResponse {
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

impl ZeroCopyType for ScsiCommandResponse {}
