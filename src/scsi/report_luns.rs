// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! REPORT LUNS: the set of logical units this session may address.

use crate::{
    export::lun::{Lun, MAX_LUNS},
    scsi::sense::{CommandStatus, asc, key},
};

const SELECT_WELL_KNOWN_ONLY: u8 = 0x01;

/// Serve REPORT LUNS. `accessible` answers "is this LUN defined and
/// authorized for the requesting session".
pub fn report_luns(
    cdb: &[u8; 16],
    accessible: impl Fn(Lun) -> bool,
) -> CommandStatus {
    let alloc_len =
        u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]]) as usize;

    // spc4r23 6.21, note 30
    if alloc_len < 16 {
        return CommandStatus::check_condition(
            key::ILLEGAL_REQUEST,
            asc::INVALID_FIELD_IN_CDB,
        );
    }

    let mut data = vec![0u8; 8];

    if cdb[2] == SELECT_WELL_KNOWN_ONLY {
        // Only LUN 0 is reported here even though LUN 1 is presented as a
        // well-known LU too; SPC suggests listing both.
        data.extend_from_slice(&0u64.to_be_bytes());
    } else {
        // LUN 0 and 1 are always visible
        data.extend_from_slice(&wire_lun(0));
        data.extend_from_slice(&wire_lun(1));
        for v in 2..MAX_LUNS {
            let lun = Lun::new(v).expect("in range");
            if accessible(lun) {
                data.extend_from_slice(&lun.to_wire());
            }
        }
    }

    let list_len = (data.len() - 8) as u32;
    data[0..4].copy_from_slice(&list_len.to_be_bytes());
    data[4..8].fill(0);

    data.truncate(alloc_len.min(data.len()));
    CommandStatus::good(data)
}

fn wire_lun(v: u64) -> [u8; 8] {
    Lun::new(v).expect("in range").to_wire()
}
