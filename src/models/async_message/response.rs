// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, U32,
    U64,
};

use crate::{
    models::{
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data_format::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    },
    target::connection::FromBytes,
};

/// AsyncEvent values this target emits (RFC 3720 § 10.9.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AsyncEventKind {
    /// A SCSI async event; sense data rides in the Data Segment.
    #[default]
    ScsiEvent = 0,
    /// Target requests logout (used when dropping all sessions).
    RequestLogout = 1,
}

/// BHS of an Async Message PDU (opcode `0x32`), pushed by the target
/// outside any initiator exchange (unit attentions, logout requests).
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AsyncMessage {
    pub opcode: RawBhsOpcode,         // 0
    pub flags: u8,                    // 1 (always 0x80)
    reserved1: [u8; 2],               // 2..4
    pub total_ahs_length: u8,         // 4
    pub data_segment_length: [u8; 3], // 5..8
    pub lun: U64<BigEndian>,          // 8..16
    pub initiator_task_tag: u32,      // 16..20 (always 0xffffffff)
    reserved2: [u8; 4],               // 20..24
    pub stat_sn: U32<BigEndian>,      // 24..28
    pub exp_cmd_sn: U32<BigEndian>,   // 28..32
    pub max_cmd_sn: U32<BigEndian>,   // 32..36
    pub async_event: u8,              // 36
    pub async_vcode: u8,              // 37
    pub parameter1: U16<BigEndian>,   // 38..40
    pub parameter2: U16<BigEndian>,   // 40..42
    pub parameter3: U16<BigEndian>,   // 42..44
    reserved3: [u8; 4],               // 44..48
}

impl AsyncMessage {
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed convert buffer AsyncMessage: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::AsyncMessage) {
            bail!(
                "AsyncMessage: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        Ok(hdr)
    }
}

#[derive(Debug, Default)]
pub struct AsyncMessageBuilder {
    pub header: AsyncMessage,
}

impl AsyncMessageBuilder {
    pub fn new(kind: AsyncEventKind) -> Self {
        AsyncMessageBuilder {
            header: AsyncMessage {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::AsyncMessage);
                    tmp
                },
                flags: 0x80,
                initiator_task_tag: 0xffff_ffff,
                async_event: kind as u8,
                ..Default::default()
            },
        }
    }

    pub fn lun(mut self, lun: u64) -> Self {
        self.header.lun.set(lun);
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

    pub fn parameter3(mut self, p: u16) -> Self {
        self.header.parameter3.set(p);
        self
    }
}

impl SendingData for AsyncMessage {
    fn get_final_bit(&self) -> bool {
        true
    }

    fn set_final_bit(&mut self) {
        self.flags = 0x80;
    }

    fn get_continue_bit(&self) -> bool {
        false
    }

    fn set_continue_bit(&mut self) {}
}

impl FromBytes for AsyncMessage {
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        AsyncMessage::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for AsyncMessage {
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

impl ZeroCopyType for AsyncMessage {}
