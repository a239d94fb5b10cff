// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use enum_dispatch::enum_dispatch;

use crate::models::opcode::BhsOpcode;

pub const HEADER_LEN: usize = 48;

/// Common helper-trait for PDUs that may be fragmented into several
/// wire-frames (RFC 3720 "F"/"C" bits).
///
/// Most PDUs travel in a single frame, but Text, Login and the data PDUs can
/// split their Data-Segment; the session loop relies only on the *Continue*
/// and *Final* flags found in byte 1 of every Basic-Header-Segment, so the
/// concrete PDU type stays out of the generic send path.
#[enum_dispatch]
pub trait SendingData: Sized {
    /// Return the current state of the **Final (F)** bit.
    fn get_final_bit(&self) -> bool;

    /// Force **F = 1** (and, if the PDU has it, clear **C**).
    fn set_final_bit(&mut self);

    /// Return the current state of the **Continue (C)** bit.
    fn get_continue_bit(&self) -> bool;

    /// Force **C = 1** (and clear **F**).
    fn set_continue_bit(&mut self);
}

/// Common functionality for any iSCSI PDU Basic Header Segment (BHS).
///
/// A BHS is always 48 bytes; a PDU may then carry AHS sections and a
/// variable-length DataSegment. This trait extracts lengths out of the BHS
/// and rebuilds the wire form.
#[enum_dispatch]
pub trait BasicHeaderSegment: Sized + SendingData {
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()>;

    /// first u8 of BHS
    fn get_opcode(&self) -> Result<BhsOpcode>;

    /// Expose Initiator Task Tag of this PDU
    fn get_initiator_task_tag(&self) -> u32;

    /// Number of extra AHS bytes (always a multiple of 4).
    fn get_ahs_length_bytes(&self) -> usize;

    fn set_ahs_length_bytes(&mut self, len: u8);

    /// Number of actual payload bytes in the DataSegment.
    fn get_data_length_bytes(&self) -> usize;

    fn set_data_length_bytes(&mut self, len: u32);

    /// Total on-wire size: BHS + padded AHS + padded DataSegment.
    #[inline]
    fn total_length_bytes(&self) -> usize {
        let padding_ahs = (4 - (self.get_ahs_length_bytes() % 4)) % 4;
        let padding_data_segment = (4 - (self.get_data_length_bytes() % 4)) % 4;

        HEADER_LEN
            + self.get_ahs_length_bytes()
            + padding_ahs
            + self.get_data_length_bytes()
            + padding_data_segment
    }
}

// Forward SendingData to &mut T
impl<T: SendingData> SendingData for &mut T {
    #[inline]
    fn get_final_bit(&self) -> bool {
        (**self).get_final_bit()
    }

    #[inline]
    fn set_final_bit(&mut self) {
        (**self).set_final_bit()
    }

    #[inline]
    fn get_continue_bit(&self) -> bool {
        (**self).get_continue_bit()
    }

    #[inline]
    fn set_continue_bit(&mut self) {
        (**self).set_continue_bit()
    }
}

// Forward BasicHeaderSegment to &mut T
impl<T: BasicHeaderSegment> BasicHeaderSegment for &mut T {
    #[inline]
    fn to_bhs_bytes(&self, buf: &mut [u8]) -> Result<()> {
        (**self).to_bhs_bytes(buf)
    }

    #[inline]
    fn get_opcode(&self) -> Result<BhsOpcode> {
        (**self).get_opcode()
    }

    #[inline]
    fn get_initiator_task_tag(&self) -> u32 {
        (**self).get_initiator_task_tag()
    }

    #[inline]
    fn get_ahs_length_bytes(&self) -> usize {
        (**self).get_ahs_length_bytes()
    }

    #[inline]
    fn set_ahs_length_bytes(&mut self, len: u8) {
        (**self).set_ahs_length_bytes(len)
    }

    #[inline]
    fn get_data_length_bytes(&self) -> usize {
        (**self).get_data_length_bytes()
    }

    #[inline]
    fn set_data_length_bytes(&mut self, len: u32) {
        (**self).set_data_length_bytes(len)
    }

    #[inline]
    fn total_length_bytes(&self) -> usize {
        (**self).total_length_bytes()
    }
}

/// A helper-trait for **builder objects** that produce a complete PDU:
/// a 48-byte BHS plus an optional Data-Segment.
///
/// The concrete type usually owns a *(header + payload)* pair and offers
/// PDU-specific setters. [`Builder::build`] finishes the frame, respecting
/// the negotiated *MaxRecvDataSegmentLength*.
pub trait Builder: Sized {
    type Header: AsRef<[u8]>;
    type Body: AsRef<[u8]>;

    /// Append raw bytes to the **Data-Segment** and update the
    /// `DataSegmentLength` field inside the owned header.
    fn append_data(&mut self, more: &[u8]);

    /// Finish the builder and produce a ready-to-send
    /// `(header_bytes, data_bytes)` frame.
    fn build(
        &mut self,
        max_recv_data_segment_length: usize,
    ) -> Result<(Self::Header, Self::Body)>;
}
