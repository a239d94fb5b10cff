// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! INQUIRY: standard data and the VPD pages initiators actually ask for
//! (supported list, serial, device identification, block limits).

use crate::{
    export::{lun::MAX_LUNS, uuid::ExaUuid},
    scsi::sense::{CommandStatus, asc, key},
};

pub const VENDOR_ID: &[u8; 8] = b"SEANODES";
pub const PRODUCT_ID: &[u8; 16] = b"EXA VIRTUAL DISK";
pub const PRODUCT_REV: &[u8; 4] = b"3.0 ";

/// T10 vendor identification; Seanodes is registered at T10.
const T10_COMPANY_ID: &[u8; 8] = b"Seanodes";

/// IEEE company OUI used inside the NAA identifier.
const IEEE_COMPANY_OUI: u64 = 0x24F3A2;

// peripheral qualifiers
const QUALIFIER_CONNECTED: u8 = 0b000;
const QUALIFIER_CAPABLE: u8 = 0b001;
const QUALIFIER_NOT_CAPABLE: u8 = 0b011;

// peripheral device types
const DEVICE_TYPE_SBC: u8 = 0x00;
const DEVICE_TYPE_WELL_KNOWN_LU: u8 = 0x0D;
const DEVICE_TYPE_UNKNOWN: u8 = 0x1F;

// VPD pages
const PAGE_SUPPORTED_VPD: u8 = 0x00;
const PAGE_UNIT_SERIAL_NUMBER: u8 = 0x80;
const PAGE_DEVICE_IDENTIFICATION: u8 = 0x83;
const PAGE_BLOCK_LIMITS: u8 = 0xB0;

// version descriptors
const VD_ISCSI_NO_VERSION_CLAIMED: u16 = 0x0960;
const VD_SPC3_T10_1416_D_R23: u16 = 0x0308;
const VD_SPC3_ANSI_INCITS_408_2005: u16 = 0x030F;
const VD_SBC_T10_0999_D_08B: u16 = 0x019B;

const ANSI_VERSION_SPC3: u8 = 0x05;
const RESPONSE_DATA_SCSI3: u8 = 0x02;

/// What the SCSI layer knows about the addressed LUN when serving INQUIRY.
pub struct InquiryEnv<'a> {
    /// Raw LUN from the wire; INQUIRY runs even for invalid values.
    pub lun_raw: u64,
    pub defined: bool,
    pub authorized: bool,
    pub serial: &'a str,
    pub buffer_size: u32,
}

pub fn inquiry(env: &InquiryEnv<'_>, cdb: &[u8; 16]) -> CommandStatus {
    let evpd = cdb[1] & 0x01 != 0;
    let page_code = cdb[2];
    let alloc_len = u16::from_be_bytes([cdb[3], cdb[4]]) as usize;

    let mut data = vec![0u8; 256];

    // peripheral qualifier and device type
    if env.lun_raw >= MAX_LUNS {
        data[0] = (QUALIFIER_NOT_CAPABLE << 5) | DEVICE_TYPE_UNKNOWN;
        data.truncate(alloc_len.min(36));
        return CommandStatus::good(data);
    }
    data[0] = if env.defined && env.authorized {
        (QUALIFIER_CONNECTED << 5) | DEVICE_TYPE_SBC
    } else if env.lun_raw <= 1 {
        (QUALIFIER_CONNECTED << 5) | DEVICE_TYPE_WELL_KNOWN_LU
    } else {
        (QUALIFIER_CAPABLE << 5) | DEVICE_TYPE_UNKNOWN
    };

    if !evpd {
        if page_code != 0 || alloc_len < 16 {
            return CommandStatus::check_condition(
                key::ILLEGAL_REQUEST,
                asc::INVALID_FIELD_IN_CDB,
            );
        }

        data[2] = ANSI_VERSION_SPC3;
        // AERC is obsolete past SPC-3 but legacy initiators still key on it.
        data[3] = 0x80 | RESPONSE_DATA_SCSI3;
        data[6] = 0x10; // MultiP
        data[7] = 0x02; // CmdQue
        data[8..16].copy_from_slice(VENDOR_ID);
        data[16..32].copy_from_slice(PRODUCT_ID);
        data[32..36].copy_from_slice(PRODUCT_REV);

        data[58..60].copy_from_slice(&VD_ISCSI_NO_VERSION_CLAIMED.to_be_bytes());
        data[60..62].copy_from_slice(&VD_SPC3_T10_1416_D_R23.to_be_bytes());
        data[62..64].copy_from_slice(&VD_SPC3_ANSI_INCITS_408_2005.to_be_bytes());
        let mut len = 64;
        if env.defined {
            data[len..len + 2].copy_from_slice(&VD_SBC_T10_0999_D_08B.to_be_bytes());
            len += 2;
        }
        data[4] = (len - 5) as u8;

        data.truncate(alloc_len.min(len));
        return CommandStatus::good(data);
    }

    // VPD pages only exist on a defined LUN (spc3r23 6.4.4)
    if !env.defined {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::INVALID_FIELD_IN_CDB,
        );
    }

    match page_code {
        PAGE_SUPPORTED_VPD => {
            data[1] = PAGE_SUPPORTED_VPD;
            data[3] = 4;
            data[4] = PAGE_SUPPORTED_VPD;
            data[5] = PAGE_BLOCK_LIMITS;
            data[6] = PAGE_DEVICE_IDENTIFICATION;
            data[7] = PAGE_UNIT_SERIAL_NUMBER;
            let len = 4 + data[3] as usize;
            data.truncate(alloc_len.min(len));
            CommandStatus::good(data)
        },
        PAGE_UNIT_SERIAL_NUMBER => {
            data[1] = PAGE_UNIT_SERIAL_NUMBER;
            data[3] = env.serial.len() as u8;
            data[4..4 + env.serial.len()].copy_from_slice(env.serial.as_bytes());
            let len = 4 + data[3] as usize;
            data.truncate(alloc_len.min(len));
            CommandStatus::good(data)
        },
        PAGE_BLOCK_LIMITS => {
            data[1] = PAGE_BLOCK_LIMITS;
            data[3] = 0x0C;
            // optimal alignment, then max/optimal transfer length in blocks
            data[6..8].copy_from_slice(&((4096u16 / 512).to_be_bytes()));
            data[8..12].copy_from_slice(&(env.buffer_size / 512).to_be_bytes());
            data[12..16].copy_from_slice(&(env.buffer_size / 512).to_be_bytes());
            let len = 4 + data[3] as usize;
            data.truncate(alloc_len.min(len));
            CommandStatus::good(data)
        },
        PAGE_DEVICE_IDENTIFICATION => {
            data[1] = PAGE_DEVICE_IDENTIFICATION;
            data[3] = 0;
            add_vendor_specific_id(&mut data, env.serial);
            add_naa_id(&mut data, naa_vendor_bits(env.serial));
            add_t10_id(&mut data, env.serial);
            let len = 4 + data[3] as usize;
            data.truncate(alloc_len.min(len));
            CommandStatus::good(data)
        },
        _ => CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::INVALID_FIELD_IN_CDB,
        ),
    }
}

// identification descriptor plumbing (spc3r23 7.6.3)

const PROTOCOL_FC_FCP2: u8 = 0x0;
const CODE_SET_BINARY: u8 = 0x1;
const CODE_SET_ASCII: u8 = 0x2;
const ASSOCIATION_LUN: u8 = 0x0;
const TYPE_VENDOR_SPECIFIC: u8 = 0x0;
const TYPE_T10_VENDOR_ID: u8 = 0x1;
const TYPE_NAA: u8 = 0x3;
const NAA_IEEE_EXTENDED: u8 = 0x2;
const NAA_IEEE_EXTENDED_SIZE: usize = 8;

/// Append an identification descriptor header; returns the offset where the
/// identifier bytes go. `data[3]` tracks the running page length.
fn add_id_header(
    data: &mut [u8],
    protocol_id: u8,
    association: u8,
    id_type: u8,
    code_set: u8,
    size: usize,
) -> usize {
    let at = data[3] as usize + 4;
    data[at] = (protocol_id << 4) | code_set;
    data[at + 1] = 0x80 | (association << 4) | id_type; // PIV set
    data[at + 2] = 0;
    data[at + 3] = size as u8;
    data[3] += (4 + size) as u8;
    at + 4
}

/// Vendor-specific identifier: the serial in ASCII. No assignment authority,
/// so no uniqueness guarantee (spc3r23 7.6.3.3).
fn add_vendor_specific_id(data: &mut [u8], serial: &str) {
    let at = add_id_header(
        data,
        PROTOCOL_FC_FCP2,
        ASSOCIATION_LUN,
        TYPE_VENDOR_SPECIFIC,
        CODE_SET_ASCII,
        serial.len(),
    );
    data[at..at + serial.len()].copy_from_slice(serial.as_bytes());
}

/// 36 vendor bits of the NAA IEEE Extended identifier: taken from the UUID
/// words when the serial is one, else a small checksum of the serial.
fn naa_vendor_bits(serial: &str) -> u64 {
    match serial.parse::<ExaUuid>() {
        Ok(uuid) => uuid.0[0] as u64 + (((uuid.0[1] as u64) & 0xF) << 32),
        Err(_) => {
            let mut chksum = 0u64;
            for (i, b) in serial.bytes().take(4).enumerate() {
                chksum += (b as u64) << (32 - i * 8);
            }
            chksum
        },
    }
}

/// NAA IEEE Extended: globally unique, wanted by Windows (spc3r23 7.6.3.6).
fn add_naa_id(data: &mut [u8], vendor_id: u64) {
    let at = add_id_header(
        data,
        PROTOCOL_FC_FCP2,
        ASSOCIATION_LUN,
        TYPE_NAA,
        CODE_SET_BINARY,
        NAA_IEEE_EXTENDED_SIZE,
    );
    data[at] = (NAA_IEEE_EXTENDED << 4) | ((vendor_id >> 32) & 0x0F) as u8;
    data[at + 1] = (vendor_id >> 24) as u8;
    data[at + 2] = (IEEE_COMPANY_OUI >> 16) as u8;
    data[at + 3] = (IEEE_COMPANY_OUI >> 8) as u8;
    data[at + 4] = IEEE_COMPANY_OUI as u8;
    data[at + 5] = (vendor_id >> 16) as u8;
    data[at + 6] = (vendor_id >> 8) as u8;
    data[at + 7] = vendor_id as u8;
}

/// T10 identifier: must be unique, wanted by VMware ESX (spc3r23 7.6.3.4).
fn add_t10_id(data: &mut [u8], serial: &str) {
    let at = add_id_header(
        data,
        PROTOCOL_FC_FCP2,
        ASSOCIATION_LUN,
        TYPE_T10_VENDOR_ID,
        CODE_SET_ASCII,
        serial.len() + 8,
    );
    data[at..at + 8].copy_from_slice(T10_COMPANY_ID);
    data[at + 8..at + 8 + serial.len()].copy_from_slice(serial.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::command::common::ScsiStatus;

    fn env(defined: bool, authorized: bool, serial: &str) -> InquiryEnv<'_> {
        InquiryEnv {
            lun_raw: 3,
            defined,
            authorized,
            serial,
            buffer_size: 262_144,
        }
    }

    fn std_inquiry_cdb(alloc: u16) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = crate::scsi::cdb::op::INQUIRY;
        cdb[3..5].copy_from_slice(&alloc.to_be_bytes());
        cdb
    }

    #[test]
    fn standard_inquiry_defined_lun() {
        let r = inquiry(&env(true, true, "AA"), &std_inquiry_cdb(255));
        assert_eq!(r.status, ScsiStatus::Good);
        assert_eq!(r.data[0], 0x00); // connected, direct access
        assert_eq!(r.data[2], ANSI_VERSION_SPC3);
        assert_eq!(r.data[3], 0x82);
        assert_eq!(&r.data[8..16], VENDOR_ID);
        // SBC descriptor present: 66 bytes total, additional length 61
        assert_eq!(r.data.len(), 66);
        assert_eq!(r.data[4], 61);
    }

    #[test]
    fn standard_inquiry_undefined_lun1_is_well_known() {
        let mut e = env(false, false, "");
        e.lun_raw = 1;
        let r = inquiry(&e, &std_inquiry_cdb(255));
        assert_eq!(r.data[0], DEVICE_TYPE_WELL_KNOWN_LU);
        assert_eq!(r.data.len(), 64);
    }

    #[test]
    fn standard_inquiry_free_lun_is_capable_unknown() {
        let mut e = env(false, false, "");
        e.lun_raw = 7;
        let r = inquiry(&e, &std_inquiry_cdb(255));
        assert_eq!(r.data[0], (QUALIFIER_CAPABLE << 5) | DEVICE_TYPE_UNKNOWN);
    }

    #[test]
    fn standard_inquiry_out_of_range_lun() {
        let mut e = env(false, false, "");
        e.lun_raw = MAX_LUNS;
        let r = inquiry(&e, &std_inquiry_cdb(255));
        assert_eq!(
            r.data[0],
            (QUALIFIER_NOT_CAPABLE << 5) | DEVICE_TYPE_UNKNOWN
        );
        assert_eq!(r.data.len(), 36);
    }

    #[test]
    fn short_alloc_len_is_rejected() {
        let r = inquiry(&env(true, true, "AA"), &std_inquiry_cdb(8));
        assert_eq!(r.status, ScsiStatus::CheckCondition);
    }

    #[test]
    fn vpd_serial_page() {
        let serial = "DEADBEEF:01234567:89ABCDEF:00000001";
        let mut cdb = std_inquiry_cdb(255);
        cdb[1] = 0x01;
        cdb[2] = PAGE_UNIT_SERIAL_NUMBER;
        let r = inquiry(&env(true, true, serial), &cdb);
        assert_eq!(r.status, ScsiStatus::Good);
        assert_eq!(r.data[1], PAGE_UNIT_SERIAL_NUMBER);
        assert_eq!(&r.data[4..4 + serial.len()], serial.as_bytes());
    }

    #[test]
    fn vpd_pages_rejected_on_undefined_lun() {
        let mut cdb = std_inquiry_cdb(255);
        cdb[1] = 0x01;
        cdb[2] = PAGE_SUPPORTED_VPD;
        let r = inquiry(&env(false, false, ""), &cdb);
        assert_eq!(r.status, ScsiStatus::CheckCondition);
    }

    #[test]
    fn vpd_device_id_page_has_three_descriptors() {
        let serial = "00000001:00000002:00000003:00000004";
        let mut cdb = std_inquiry_cdb(255);
        cdb[1] = 0x01;
        cdb[2] = PAGE_DEVICE_IDENTIFICATION;
        let r = inquiry(&env(true, true, serial), &cdb);
        assert_eq!(r.status, ScsiStatus::Good);
        assert_eq!(r.data[1], PAGE_DEVICE_IDENTIFICATION);

        // walk the descriptors: vendor-specific, NAA, T10
        let mut off = 4;
        let mut types = Vec::new();
        while off < r.data.len() {
            types.push(r.data[off + 1] & 0x0F);
            off += 4 + r.data[off + 3] as usize;
        }
        assert_eq!(types, vec![TYPE_VENDOR_SPECIFIC, TYPE_NAA, TYPE_T10_VENDOR_ID]);
    }

    #[test]
    fn naa_bits_from_uuid_serial() {
        let serial = "DEADBEEF:0000000A:00000000:00000000";
        assert_eq!(naa_vendor_bits(serial), 0xDEADBEEF + (0xA << 32));
    }
}
