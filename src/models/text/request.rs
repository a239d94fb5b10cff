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

/// BHS of a Text Request PDU (opcode `0x04`): NUL-delimited `key=value`
/// items in the Data Segment, SendTargets among them.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TextRequest {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: u8,                           // 1 (F, C)
    reserved1: [u8; 2],                      // 2..4
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: u32,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub cmd_sn: U32<BigEndian>,              // 24..28
    pub exp_stat_sn: U32<BigEndian>,         // 28..32
    reserved2: [u8; 16],                     // 32..48
}

impl TextRequest {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed convert buffer TextRequest: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::TextReq) {
            bail!(
                "TextRequest: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }

    #[inline]
    pub fn immediate(&self) -> bool {
        self.opcode.i()
    }
}

impl SendingData for TextRequest {
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

impl FromBytes for TextRequest {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        TextRequest::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for TextRequest {
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

impl ZeroCopyType for TextRequest {}
