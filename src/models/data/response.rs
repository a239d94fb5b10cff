// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, anyhow, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32, U64,
};

use crate::{
    models::{
        command::{common::ScsiStatus, zero_copy::RawScsiStatus},
        common::{BasicHeaderSegment, HEADER_LEN, SendingData},
        data::common::RawDataInFlags,
        data_format::ZeroCopyType,
        opcode::{BhsOpcode, Opcode, RawBhsOpcode},
    },
    target::connection::FromBytes,
};

/// BHS of a SCSI Data-In PDU (opcode `0x25`): read payload to the initiator.
///
/// With phase-collapsed reads the last chunk carries the S bit, the SCSI
/// status and StatSN, and no separate SCSI Response follows.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ScsiDataIn {
    pub opcode: RawBhsOpcode,                // 0
    pub flags: RawDataInFlags,               // 1
    reserved1: u8,                           // 2
    pub status_or_rsvd: RawScsiStatus,       // 3 (valid iff S=1)
    pub total_ahs_length: u8,                // 4
    pub data_segment_length: [u8; 3],        // 5..8
    pub lun: U64<BigEndian>,                 // 8..16
    pub initiator_task_tag: u32,             // 16..20
    pub target_transfer_tag: U32<BigEndian>, // 20..24
    pub stat_sn_or_rsvd: U32<BigEndian>,     // 24..28 (valid iff S=1)
    pub exp_cmd_sn: U32<BigEndian>,          // 28..32
    pub max_cmd_sn: U32<BigEndian>,          // 32..36
    pub data_sn: U32<BigEndian>,             // 36..40
    pub buffer_offset: U32<BigEndian>,       // 40..44
    pub residual_count: U32<BigEndian>,      // 44..48 (valid iff S=1)
}

impl ScsiDataIn {
    /// Decoded SCSI status iff `S=1`.
    #[inline]
    pub fn scsi_status(&self) -> Option<ScsiStatus> {
        if self.flags.s() {
            self.status_or_rsvd.decode().ok()
        } else {
            None
        }
    }

    /// Sets/clears SCSI status and enforces `S ⇒ F`.
    #[inline]
    pub fn set_scsi_status(&mut self, st: Option<ScsiStatus>) {
        match st {
            Some(s) => {
                self.flags.set_s(true);
                self.flags.set_fin(true);
                self.status_or_rsvd.encode(s);
            },
            None => {
                self.flags.set_s(false);
                self.status_or_rsvd.encode(ScsiStatus::Good);
                self.stat_sn_or_rsvd.set(0);
                self.residual_count.set(0);
            },
        }
    }

    #[inline]
    pub fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != HEADER_LEN {
            bail!("buffer length must be {HEADER_LEN}, got {}", buf.len());
        }
        buf.copy_from_slice(self.as_bytes());
        if !self.flags.s() {
            buf[3] = 0; // status
            buf[24..28].fill(0); // StatSN
            buf[44..48].fill(0); // ResidualCount
        }
        Ok(())
    }

    #[inline]
    pub fn from_bhs_bytes(buf: &mut [u8]) -> Result<&mut Self> {
        let hdr = <Self as zerocopy::FromBytes>::mut_from_bytes(buf)
            .map_err(|e| anyhow!("failed convert buffer ScsiDataIn: {e}"))?;
        if hdr.opcode.opcode_known() != Some(Opcode::ScsiDataIn) {
            bail!(
                "ScsiDataIn: invalid opcode 0x{:02x}",
                hdr.opcode.opcode_raw()
            );
        }
        hdr.flags.validate()?;
        Ok(hdr)
    }
}

/// Builder for Data-In PDUs.
#[derive(Debug, Default)]
pub struct ScsiDataInBuilder {
    pub header: ScsiDataIn,
}

impl ScsiDataInBuilder {
    pub fn new() -> Self {
        ScsiDataInBuilder {
            header: ScsiDataIn {
                opcode: {
                    let mut tmp = RawBhsOpcode::default();
                    tmp.set_opcode_known(Opcode::ScsiDataIn);
                    tmp
                },
                target_transfer_tag: 0xffff_ffff_u32.into(),
                ..Default::default()
            },
        }
    }

    pub fn initiator_task_tag(mut self, tag: u32) -> Self {
        self.header.initiator_task_tag = tag;
        self
    }

    pub fn data_sn(mut self, sn: u32) -> Self {
        self.header.data_sn.set(sn);
        self
    }

    pub fn buffer_offset(mut self, off: u32) -> Self {
        self.header.buffer_offset.set(off);
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

    /// Final chunk: sets F, S, status and StatSN.
    pub fn collapse_status(mut self, st: ScsiStatus, stat_sn: u32) -> Self {
        self.header.set_scsi_status(Some(st));
        self.header.stat_sn_or_rsvd.set(stat_sn);
        self
    }

    pub fn residual_underflow(mut self, count: u32) -> Self {
        if count > 0 {
            self.header.flags.set_underflow(true);
            self.header.residual_count.set(count);
        }
        self
    }
}

impl SendingData for ScsiDataIn {
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
        // Clear F; and to keep S ⇒ F, also clear S.
        self.flags.set_fin(false);
        self.flags.set_s(false);
    }
}

impl FromBytes for ScsiDataIn {
    #[inline]
    fn from_bhs_bytes(bytes: &mut [u8]) -> Result<&mut Self> {
        ScsiDataIn::from_bhs_bytes(bytes)
    }
}

impl BasicHeaderSegment for ScsiDataIn {
    #[inline]
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        self.to_bhs_bytes(buf)
    }

    #[inline]
    fn get_opcode(&self) -> Result<BhsOpcode> {
        BhsOpcode::try_from(self.opcode.raw())
    }

    #[inline]
    fn get_initiator_task_tag(&self) -> u32 {
        self.initiator_task_tag
    }

    #[inline]
    fn get_ahs_length_bytes(&self) -> usize {
        (self.total_ahs_length as usize) * 4
    }

    #[inline]
    fn set_ahs_length_bytes(&mut self, len_bytes: u8) {
        self.total_ahs_length = len_bytes >> 2;
    }

    #[inline]
    fn get_data_length_bytes(&self) -> usize {
        u32::from_be_bytes([
            0,
            self.data_segment_length[0],
            self.data_segment_length[1],
            self.data_segment_length[2],
        ]) as usize
    }

    #[inline]
    fn set_data_length_bytes(&mut self, len: u32) {
        let be = len.to_be_bytes();
        self.data_segment_length = [be[1], be[2], be[3]];
    }
}

impl ZeroCopyType for ScsiDataIn {}
