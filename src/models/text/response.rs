// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::{
    models::{
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_format::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    },
    target::connection::FromBytes,
};

const FLAG_FINAL: u8 = 0x80;
const FLAG_CONTINUE: u8 = 0x40;

/// BHS of a Text Response PDU (opcode `0x24`).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TextResponse {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F, C)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: u32,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub stat_sn: U32<BigEndian>,             // 24..28
    pub exp_cmd_sn: U32<BigEndian>,          // 28..32
    pub max_cmd_sn: U32<BigEndian>,          // 32..36
    reserved2: [u8; 12],                     // 36..48
}

impl TextResponse {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed convert buffer TextResponse: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::TextResp) {
            bail!(
                "TextResponse: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

#[derive(Debug, Default)]
pub struct TextResponseBuilder {
    pub header: TextResponse,
}

impl TextResponseBuilder {
    pub fn new() -> Self {
        TextResponseBuilder {
            header: TextResponse {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::TextResp);
                    tmp
                },
                ..Default::default()
            },
        }
    }

    pub fn final_bit(mut self, on: bool) -> Self {
        if on {
            self.header.flags |= FLAG_FINAL;
        } else {
            self.header.flags &= !FLAG_FINAL;
        }
        self
    }

    pub fn lun(mut self, lun: u64) -> Self {
        self.header.lun.set(lun);
        self
    }

    pub fn initiator_task_tag(mut self, tag: u32) -> Self {
        self.header.initiator_task_tag = tag;
        self
    }

    pub fn target_transfer_tag(mut self, ttt: u32) -> Self {
        self.header.target_transfer_tag.set(ttt);
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
}

impl SendingData for TextResponse {
    fn get_final_bit(&self) -> bool {
        self.flags & FLAG_FINAL != 0
    }

    fn set_final_bit(&mut self) {
        self.flags |= FLAG_FINAL;
        self.flags &= !FLAG_CONTINUE;
    }

    fn get_continue_bit(&self) -> bool {
        self.flags & FLAG_CONTINUE != 0
    }

    fn set_continue_bit(&mut self) {
        self.flags |= FLAG_CONTINUE;
        self.flags &= !FLAG_FINAL;
    }
}

impl FromBytes for TextResponse {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        TextResponse::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for TextResponse {
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

impl ZeroCopyType for TextResponse {}
