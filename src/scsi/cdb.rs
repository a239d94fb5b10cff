// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SCSI CDB opcodes and field extraction for the forms this target serves.

/// Fixed CDB size carried by the iSCSI BHS and by the packed cluster events.
pub const CDB_MAX_FIXED_LENGTH: usize = 16;

pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0A;
    pub const INQUIRY: u8 = 0x12;
    pub const VERIFY_6: u8 = 0x13;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const RESERVE_6: u8 = 0x16;
    pub const RELEASE_6: u8 = 0x17;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const READ_CAPACITY: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const VERIFY_10: u8 = 0x2F;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const RESERVE_10: u8 = 0x56;
    pub const RELEASE_10: u8 = 0x57;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const PERSISTENT_RESERVE_IN: u8 = 0x5E;
    pub const PERSISTENT_RESERVE_OUT: u8 = 0x5F;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const VERIFY_16: u8 = 0x8F;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub const REPORT_LUNS: u8 = 0xA0;
    pub const READ_12: u8 = 0xA8;
    pub const WRITE_12: u8 = 0xAA;
}

/// Service action of SERVICE ACTION IN (16) implementing READ CAPACITY (16).
pub const READ_CAPACITY_16: u8 = 0x10;

/// `(LBA, transfer length in blocks)` of a READ CDB, per form.
pub fn read_lba_len(cdb: &[u8; 16]) -> Option<(u64, u32)> {
    match cdb[0] {
        op::READ_6 => {
            let lba = (u32::from_be_bytes([cdb[0], cdb[1], cdb[2], cdb[3]])
                & 0x001f_ffff) as u64;
            Some((lba, cdb[4] as u32))
        },
        op::READ_10 => Some((
            u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
            u16::from_be_bytes([cdb[7], cdb[8]]) as u32,
        )),
        op::READ_12 => Some((
            u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
            u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]),
        )),
        op::READ_16 => Some((
            u64::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
            ]),
            u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
        )),
        _ => None,
    }
}

/// `(LBA, transfer length in blocks, FUA)` of a WRITE CDB, per form. A
/// WRITE(6) length of zero means 256 blocks.
pub fn write_lba_len(cdb: &[u8; 16]) -> Option<(u64, u32, bool)> {
    match cdb[0] {
        op::WRITE_6 => {
            let lba = (u32::from_be_bytes([cdb[0], cdb[1], cdb[2], cdb[3]])
                & 0x001f_ffff) as u64;
            let len = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            Some((lba, len, false))
        },
        op::WRITE_10 => Some((
            u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
            u16::from_be_bytes([cdb[7], cdb[8]]) as u32,
            cdb[1] & 0x08 != 0,
        )),
        op::WRITE_12 => Some((
            u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64,
            u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]),
            cdb[1] & 0x08 != 0,
        )),
        op::WRITE_16 => Some((
            u64::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
            ]),
            u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]),
            cdb[1] & 0x08 != 0,
        )),
        _ => None,
    }
}

/// Commands the cluster reservation engine arbitrates.
#[inline]
pub fn is_reservation_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        op::PERSISTENT_RESERVE_OUT | op::RESERVE_6 | op::RELEASE_6
    )
}

/// Commands that modify the medium, for the reservation conflict table.
#[inline]
pub fn is_write_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        op::WRITE_6
            | op::WRITE_10
            | op::WRITE_12
            | op::WRITE_16
            | op::SYNCHRONIZE_CACHE_10
            | op::SYNCHRONIZE_CACHE_16
    )
}

/// Commands that read the medium, for the reservation conflict table.
#[inline]
pub fn is_read_opcode(opcode: u8) -> bool {
    matches!(opcode, op::READ_6 | op::READ_10 | op::READ_12 | op::READ_16)
}
